use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::auth::{self, keep_alive, KeepAlive, UrnContact};
use crate::collab::{CardOutcome, Presenter};
use crate::error::{Code, Error, Result};
use crate::model::{Person, StateMachine, SubStationState, TerminalKind};
use crate::net::Link;
use crate::protocol::{self, Command, FieldType, Message};
use crate::terminal::station::search_person;
use crate::terminal::{field, kind, Terminal};

struct SubStationInner {
    state: SubStationState,
    station: Option<SocketAddr>,
    pending_voter: Option<Person>,
}

/// An auxiliary check-in desk. Badge reads are forwarded to its Station.
pub struct SubStation {
    contact: UrnContact,
    presenter: Arc<dyn Presenter>,
    inner: Mutex<SubStationInner>,
}

impl SubStation {
    pub fn new(contact: UrnContact, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            contact,
            presenter,
            inner: Mutex::new(SubStationInner {
                state: SubStationState::Inactive,
                station: None,
                pending_voter: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SubStationInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SubStationState {
        self.inner().state
    }

    pub fn station(&self) -> Option<SocketAddr> {
        self.inner().station
    }

    pub fn pending_voter(&self) -> Option<Person> {
        self.inner().pending_voter.clone()
    }

    pub fn select_voter(&self, voter: Person) -> Result<()> {
        let mut inner = self.inner();
        inner.state.expect(&[SubStationState::Active])?;
        inner.pending_voter = Some(voter);
        drop(inner);
        self.presenter.update();
        Ok(())
    }

    pub async fn search_person(&self, first_name_like: &str, last_name_like: &str) -> Result<Vec<Person>> {
        self.state().expect(&[SubStationState::Active, SubStationState::Waiting])?;
        search_person(&self.contact, first_name_like, last_name_like).await
    }

    async fn forward_badge(&self, badge: &str) -> Result<CardOutcome> {
        let (station, voter) = {
            let inner = self.inner();
            inner.state.expect(&[SubStationState::Active])?;
            let station = inner
                .station
                .ok_or_else(|| Error::new(Code::Invariant, "active without a station"))?;
            (station, inner.pending_voter.clone())
        };

        let mut request = Message::new(kind::READ_CARD).with_text(field::BADGE, badge);
        if let Some(voter) = &voter {
            request = request.with_object(field::VOTER, voter)?;
        }
        let outcome: CardOutcome =
            protocol::request(self.contact.network.as_ref(), station, Command::ReadCard, &request)
                .await?
                .verify(kind::CARD_OUTCOME, &[(field::OUTCOME, FieldType::Object)])?
                .object(field::OUTCOME)?;

        // The selected voter now has a Post.
        if let (CardOutcome::Associated(_), Some(voter)) = (&outcome, voter) {
            let mut inner = self.inner();
            if inner.pending_voter.as_ref().map(|v| &v.id) == Some(&voter.id) {
                inner.pending_voter = None;
            }
        }
        Ok(outcome)
    }

    fn set_state(&self, next: SubStationState) {
        let mut inner = self.inner();
        if inner.state == next {
            return;
        }
        match inner.state.transition(next) {
            Ok(()) => debug!("Substation is now {next:?}"),
            Err(err) => debug!("Ignoring state change: {err}"),
        }
        if next == SubStationState::Inactive {
            inner.pending_voter = None;
        }
    }
}

#[async_trait]
impl KeepAlive for SubStation {
    fn contact(&self) -> &UrnContact {
        &self.contact
    }

    fn is_authenticated(&self) -> bool {
        self.state() != SubStationState::Inactive
    }

    async fn authenticate(&self) -> Result<()> {
        self.state().expect(&[SubStationState::Inactive])?;
        let welcome = auth::authenticate(
            self.contact.network.as_ref(),
            self.contact.urn,
            TerminalKind::SubStation,
            self.contact.key(),
            Vec::new(),
            &[(field::STATION, FieldType::Text)],
        )
        .await?;
        let station: SocketAddr = welcome
            .text(field::STATION)?
            .parse()
            .map_err(|e| Error::malformed(format!("station address: {e}")))?;
        {
            let mut inner = self.inner();
            inner.state.transition(SubStationState::Active)?;
            inner.station = Some(station);
        }
        self.presenter.update();
        Ok(())
    }

    async fn invalid_authentication(&self, err: Error) {
        self.set_state(SubStationState::Inactive);
        self.presenter.print_warning("Authentication revoked", err.specific_message());
        self.presenter.update();
    }
}

#[async_trait]
impl Terminal for SubStation {
    fn kind(&self) -> TerminalKind {
        TerminalKind::SubStation
    }

    fn verify_peer_ip(&self, command: Command, peer: IpAddr) -> bool {
        match command {
            Command::StationShutdown | Command::StationActive => {
                self.station().map(|station| station.ip()) == Some(peer)
            }
            Command::UrnShutdown => peer == self.contact.urn.ip(),
            _ => false,
        }
    }

    async fn handle(&self, command: Command, link: &mut Link) -> Result<()> {
        link.receive().await?;
        match command {
            Command::StationShutdown => {
                self.set_state(SubStationState::Waiting);
                self.presenter.print_warning("Station", "the station has shut down");
            }
            Command::StationActive => self.set_state(SubStationState::Active),
            Command::UrnShutdown => {
                self.set_state(SubStationState::Inactive);
                self.presenter.print_warning("Urn", "the urn has shut down");
            }
            _ => {
                return Err(Error::new(
                    Code::UnknownCommand,
                    format!("substation cannot handle {command}"),
                ))
            }
        }
        self.presenter.update();
        link.send_ack().await
    }

    fn has_card_reader(&self) -> bool {
        true
    }

    async fn read_card(&self, badge: &str) -> CardOutcome {
        match self.forward_badge(badge).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.presenter.print_error(&err);
                CardOutcome::Rejected(err.specific_message().to_string())
            }
        }
    }

    fn polls(&self) -> bool {
        true
    }

    async fn poll(&self) {
        keep_alive(self).await;
    }

    async fn after_close(&self) {
        self.set_state(SubStationState::Inactive);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collab::LogPresenter;
    use crate::net::SimulatedNetwork;

    fn substation() -> SubStation {
        let network = SimulatedNetwork::new(Duration::from_millis(200));
        let contact = UrnContact::new(
            Arc::new(network.host("10.0.2.1".parse().unwrap())),
            "10.0.0.1:4000".parse().unwrap(),
            "secret",
        );
        SubStation::new(contact, Arc::new(LogPresenter))
    }

    #[test]
    fn station_events_move_between_active_and_waiting() {
        let sub = substation();
        // Not yet authenticated: a Station event cannot activate it.
        sub.set_state(SubStationState::Waiting);
        assert_eq!(sub.state(), SubStationState::Inactive);

        sub.inner().state = SubStationState::Active;
        sub.set_state(SubStationState::Waiting);
        assert_eq!(sub.state(), SubStationState::Waiting);
        sub.set_state(SubStationState::Active);
        assert_eq!(sub.state(), SubStationState::Active);
        sub.set_state(SubStationState::Inactive);
        assert_eq!(sub.state(), SubStationState::Inactive);
    }

    #[test]
    fn peers_are_filtered() {
        let sub = substation();
        let station: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(!sub.verify_peer_ip(Command::StationShutdown, station));
        sub.inner().station = Some("10.0.0.2:4000".parse().unwrap());
        assert!(sub.verify_peer_ip(Command::StationShutdown, station));
        assert!(!sub.verify_peer_ip(Command::ReadCard, station));
        assert!(sub.verify_peer_ip(Command::UrnShutdown, "10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn waiting_substation_rejects_badges() {
        let sub = substation();
        sub.inner().state = SubStationState::Waiting;
        sub.inner().station = Some("10.0.0.2:4000".parse().unwrap());
        assert!(matches!(sub.read_card("144").await, CardOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn unreachable_station_rejects_badges() {
        let sub = substation();
        sub.inner().state = SubStationState::Active;
        sub.inner().station = Some("10.0.0.2:4000".parse().unwrap());
        sub.inner().pending_voter = Some(Person::example());
        assert!(matches!(sub.read_card("144").await, CardOutcome::Rejected(_)));
        assert!(sub.pending_voter().is_some());
    }
}
