use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::{self, keep_alive, KeepAlive, UrnContact};
use crate::collab::{CardOutcome, Presenter};
use crate::error::{Code, Error, Result};
use crate::model::{Person, PostState, StateMachine, StationState, TerminalKind, UNASSIGNED_BADGE};
use crate::net::Link;
use crate::protocol::{self, Command, FieldType, Message, Verified};
use crate::terminal::post::parse_state;
use crate::terminal::{field, kind, Admission, ReservationGate, Terminal, MAX_SEARCH_RESULTS};

/// The Station's cached view of one of its Posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSlot {
    pub addr: SocketAddr,
    pub state: PostState,
    pub badge: String,
    pub voter: Option<Person>,
}

impl PostSlot {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: PostState::Inactive,
            badge: UNASSIGNED_BADGE.to_string(),
            voter: None,
        }
    }

    fn clear(&mut self) {
        self.badge = UNASSIGNED_BADGE.to_string();
        self.voter = None;
    }

    /// Apply a state reported by the Post itself.
    fn apply(&mut self, state: PostState, badge: &str) {
        self.state = state;
        if badge == UNASSIGNED_BADGE {
            self.clear();
        } else {
            self.badge = badge.to_string();
        }
    }
}

struct StationInner {
    state: StationState,
    posts: Vec<PostSlot>,
    substations: Vec<SocketAddr>,
    pending_voter: Option<Person>,
}

impl StationInner {
    fn slot_mut(&mut self, addr: SocketAddr) -> Option<&mut PostSlot> {
        self.posts.iter_mut().find(|slot| slot.addr == addr)
    }

    fn slot_by_ip(&mut self, ip: IpAddr) -> Option<&mut PostSlot> {
        self.posts.iter_mut().find(|slot| slot.addr.ip() == ip)
    }
}

/// The polling-station terminal: checks voters in and assigns them to Posts.
pub struct Station {
    contact: UrnContact,
    presenter: Arc<dyn Presenter>,
    gate: ReservationGate,
    inner: Mutex<StationInner>,
}

/// Decode a Post's state message.
fn read_post_state(reply: Message) -> Result<(PostState, String)> {
    let reply = reply.verify(
        kind::POST_STATE,
        &[(field::STATE, FieldType::Text), (field::BADGE, FieldType::Text)],
    )?;
    Ok((parse_state(reply.text(field::STATE)?)?, reply.text(field::BADGE)?.to_string()))
}

impl Station {
    pub fn new(contact: UrnContact, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            contact,
            presenter,
            gate: ReservationGate::new(),
            inner: Mutex::new(StationInner {
                state: StationState::Inactive,
                posts: Vec::new(),
                substations: Vec::new(),
                pending_voter: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, StationInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> StationState {
        self.inner().state
    }

    pub fn posts(&self) -> Vec<PostSlot> {
        self.inner().posts.clone()
    }

    pub fn post(&self, addr: SocketAddr) -> Option<PostSlot> {
        self.inner().posts.iter().find(|slot| slot.addr == addr).cloned()
    }

    pub fn substations(&self) -> Vec<SocketAddr> {
        self.inner().substations.clone()
    }

    pub fn pending_voter(&self) -> Option<Person> {
        self.inner().pending_voter.clone()
    }

    /// Choose the voter the next badge read will be associated with.
    pub fn select_voter(&self, voter: Person) -> Result<()> {
        let mut inner = self.inner();
        inner.state.expect(&[StationState::Active])?;
        inner.pending_voter = Some(voter);
        drop(inner);
        self.presenter.update();
        Ok(())
    }

    pub fn clear_voter(&self) {
        self.inner().pending_voter = None;
        self.presenter.update();
    }

    /// Search the Urn's register of voters.
    pub async fn search_person(&self, first_name_like: &str, last_name_like: &str) -> Result<Vec<Person>> {
        self.state().expect(&[StationState::Active])?;
        search_person(&self.contact, first_name_like, last_name_like).await
    }

    /// Ask a Post for its state and update its slot.
    pub async fn refresh_post(&self, addr: SocketAddr) -> Result<PostState> {
        let reply = protocol::request(
            self.contact.network.as_ref(),
            addr,
            Command::PostState,
            &Message::new(kind::NOTICE),
        )
        .await?;
        let (state, badge) = read_post_state(reply)?;
        if let Some(slot) = self.inner().slot_mut(addr) {
            slot.apply(state, &badge);
        }
        Ok(state)
    }

    /// Refresh every Post; unreachable ones keep their cached state.
    pub async fn refresh_posts(&self) {
        let addrs: Vec<SocketAddr> = self.inner().posts.iter().map(|slot| slot.addr).collect();
        for addr in addrs {
            if let Err(err) = self.refresh_post(addr).await {
                debug!("Could not refresh post {addr}: {err}");
            }
        }
    }

    /// Recover a Post from an inconsistent state.
    pub async fn reset_post(&self, addr: SocketAddr) -> Result<()> {
        if self.post(addr).is_none() {
            return Err(Error::new(Code::UnexpectedValue, format!("{addr} is not one of our posts")));
        }
        let reply = protocol::request(
            self.contact.network.as_ref(),
            addr,
            Command::ResetPost,
            &Message::new(kind::NOTICE),
        )
        .await;
        let result = reply.and_then(read_post_state).map(|(state, badge)| {
            if let Some(slot) = self.inner().slot_mut(addr) {
                slot.apply(state, &badge);
            }
        });
        match &result {
            Ok(()) => self.presenter.print_success("Reset", &format!("post {addr} is available again")),
            Err(err) => self.presenter.print_error(err),
        }
        self.presenter.update();
        result
    }

    /// Handle a badge read, here or forwarded by a SubStation with its own voter.
    async fn handle_badge(&self, badge: &str, voter: Option<Person>) -> CardOutcome {
        if self.state() != StationState::Active {
            return CardOutcome::Rejected("the station is not active".to_string());
        }
        if badge.is_empty() || badge == UNASSIGNED_BADGE {
            return CardOutcome::Rejected(format!("`{badge}` is not a badge"));
        }

        // Checks and association happen under one admission.
        let admission = match self.gate.admit().await {
            Ok(admission) => admission,
            Err(err) => return CardOutcome::Rejected(err.to_string()),
        };

        // A badge already on a Post is either coming back or misused.
        let assigned = self
            .inner()
            .posts
            .iter()
            .find(|slot| slot.badge == badge)
            .map(|slot| (slot.addr, slot.state));
        if let Some((post, state)) = assigned {
            let outcome = match state {
                PostState::VoteSent => self.release(post, badge).await,
                _ => CardOutcome::BadgeInUse(post),
            };
            drop(admission);
            return outcome;
        }

        let Some(voter) = voter else {
            return CardOutcome::NoVoterSelected;
        };
        let voting_at = self
            .inner()
            .posts
            .iter()
            .find(|slot| slot.voter.as_ref().map(|v| &v.id) == Some(&voter.id))
            .map(|slot| slot.addr);
        if let Some(post) = voting_at {
            return CardOutcome::Rejected(format!("voter {} is already at post {post}", voter.id));
        }

        self.associate(admission, badge, voter).await
    }

    async fn associate(&self, admission: Admission, badge: &str, voter: Person) -> CardOutcome {
        let candidates: Vec<SocketAddr> = self
            .inner()
            .posts
            .iter()
            .filter(|slot| slot.state.is_available())
            .map(|slot| slot.addr)
            .collect();

        // The reservation is held until the association attempt is over.
        let reservation = match admission
            .reserve(candidates, |post| async move {
                matches!(self.refresh_post(post).await, Ok(state) if state.is_available())
            })
            .await
        {
            Some(reservation) => reservation,
            None => return CardOutcome::NoPostAvailable,
        };
        let post = reservation.post();

        let request = match Message::new(kind::ASSOCIATION)
            .with_text(field::BADGE, badge)
            .with_object(field::VOTER, &voter)
        {
            Ok(request) => request,
            Err(err) => return CardOutcome::Rejected(err.to_string()),
        };
        let reply = protocol::request(self.contact.network.as_ref(), post, Command::Association, &request)
            .await
            .and_then(read_post_state);
        let outcome = match reply {
            Ok((state, reported_badge)) => {
                let mut inner = self.inner();
                if let Some(slot) = inner.slot_mut(post) {
                    slot.apply(state, &reported_badge);
                    slot.voter = Some(voter.clone());
                }
                // The operator may have picked someone else meanwhile.
                if inner.pending_voter.as_ref().map(|v| &v.id) == Some(&voter.id) {
                    inner.pending_voter = None;
                }
                info!("Voter {} associated with post {post} (badge {badge})", voter.id);
                CardOutcome::Associated(post)
            }
            Err(err) => {
                warn!("Association with post {post} failed: {err}");
                CardOutcome::Rejected(err.specific_message().to_string())
            }
        };
        drop(reservation);
        self.presenter.update();
        outcome
    }

    /// The voter has returned their badge: free the Post.
    async fn release(&self, post: SocketAddr, badge: &str) -> CardOutcome {
        let request = Message::new(kind::RELEASE).with_text(field::BADGE, badge);
        let reply = protocol::request(self.contact.network.as_ref(), post, Command::DestroyAssociation, &request)
            .await
            .and_then(read_post_state);
        match reply {
            Ok((state, reported_badge)) => {
                if let Some(slot) = self.inner().slot_mut(post) {
                    slot.apply(state, &reported_badge);
                    slot.clear();
                }
                self.presenter.update();
                CardOutcome::Released(post)
            }
            Err(err) => CardOutcome::Rejected(err.specific_message().to_string()),
        }
    }

    fn post_state_notified(&self, peer: IpAddr, request: Message) -> Result<()> {
        let (state, badge) = read_post_state(request)?;
        let mut inner = self.inner();
        let slot = inner
            .slot_by_ip(peer)
            .ok_or_else(|| Error::new(Code::Unauthorized, format!("{peer} is not one of our posts")))?;
        debug!("Post {} is now {state:?}", slot.addr);
        slot.apply(state, &badge);
        Ok(())
    }

    fn read_card_forwarded(&self, request: Message) -> Result<(String, Option<Person>)> {
        let request = request.verify(kind::READ_CARD, &[(field::BADGE, FieldType::Text)])?;
        let voter = optional_voter(&request)?;
        Ok((request.text(field::BADGE)?.to_string(), voter))
    }

    /// Tell every Post and SubStation something, ignoring failures.
    async fn broadcast(&self, command: Command, include_posts: bool) {
        let targets: Vec<SocketAddr> = {
            let inner = self.inner();
            let posts = inner.posts.iter().map(|slot| slot.addr).filter(|_| include_posts);
            posts.chain(inner.substations.iter().copied()).collect()
        };
        for target in targets {
            if let Err(err) =
                protocol::notify(self.contact.network.as_ref(), target, command, &Message::new(kind::NOTICE)).await
            {
                debug!("Could not send {command} to {target}: {err}");
            }
        }
    }

    fn deactivate(&self) {
        let mut inner = self.inner();
        if inner.state != StationState::Inactive {
            let _ = inner.state.transition(StationState::Inactive);
        }
        inner.pending_voter = None;
    }
}

/// Read the optional voter of a forwarded badge read.
fn optional_voter(request: &Message<Verified>) -> Result<Option<Person>> {
    match request.object::<Person>(field::VOTER) {
        Ok(voter) => Ok(Some(voter)),
        Err(_) if !request.field_names().any(|name| name == field::VOTER) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Voter search shared by Station and SubStation.
pub(crate) async fn search_person(
    contact: &UrnContact,
    first_name_like: &str,
    last_name_like: &str,
) -> Result<Vec<Person>> {
    let request = Message::new(kind::SEARCH)
        .with_text(field::FIRST_NAME, first_name_like)
        .with_text(field::LAST_NAME, last_name_like);
    protocol::request(contact.network.as_ref(), contact.urn, Command::SearchPerson, &request)
        .await?
        .verify(kind::SEARCH_RESULT, &[(field::PERSONS, FieldType::Object)])?
        .object::<Vec<Person>>(field::PERSONS)
        .map(|mut persons| {
            persons.truncate(MAX_SEARCH_RESULTS);
            persons
        })
}

#[async_trait]
impl KeepAlive for Station {
    fn contact(&self) -> &UrnContact {
        &self.contact
    }

    fn is_authenticated(&self) -> bool {
        self.state() == StationState::Active
    }

    async fn authenticate(&self) -> Result<()> {
        self.state().expect(&[StationState::Inactive])?;
        let welcome = auth::authenticate(
            self.contact.network.as_ref(),
            self.contact.urn,
            TerminalKind::Station,
            self.contact.key(),
            Vec::new(),
            &[
                (field::POSTS, FieldType::Object),
                (field::SUBSTATIONS, FieldType::Object),
            ],
        )
        .await?;
        let posts: Vec<SocketAddr> = welcome.object(field::POSTS)?;
        let substations: Vec<SocketAddr> = welcome.object(field::SUBSTATIONS)?;

        {
            let mut inner = self.inner();
            inner.state.transition(StationState::Active)?;
            // Keep what is known about Posts that are still ours.
            let slots: Vec<PostSlot> = posts
                .iter()
                .map(|&addr| {
                    inner
                        .posts
                        .iter()
                        .find(|slot| slot.addr == addr)
                        .cloned()
                        .unwrap_or_else(|| PostSlot::new(addr))
                })
                .collect();
            inner.posts = slots;
            inner.substations = substations;
        }
        self.broadcast(Command::StationActive, false).await;
        self.refresh_posts().await;
        self.presenter.update();
        Ok(())
    }

    async fn invalid_authentication(&self, err: Error) {
        self.deactivate();
        self.presenter.print_warning("Authentication revoked", err.specific_message());
        self.presenter.update();
    }
}

#[async_trait]
impl Terminal for Station {
    fn kind(&self) -> TerminalKind {
        TerminalKind::Station
    }

    fn verify_peer_ip(&self, command: Command, peer: IpAddr) -> bool {
        let inner = self.inner();
        match command {
            Command::PostStateNotify => inner.posts.iter().any(|slot| slot.addr.ip() == peer),
            Command::ReadCard => inner.substations.iter().any(|sub| sub.ip() == peer),
            Command::UrnShutdown => peer == self.contact.urn.ip(),
            _ => false,
        }
    }

    async fn handle(&self, command: Command, link: &mut Link) -> Result<()> {
        let peer = link.peer().ip();
        let request = link.receive().await?;
        match command {
            Command::PostStateNotify => {
                self.post_state_notified(peer, request)?;
                self.presenter.update();
                link.send_ack().await
            }
            Command::ReadCard => {
                let (badge, voter) = self.read_card_forwarded(request)?;
                let outcome = self.handle_badge(&badge, voter).await;
                info!("Badge {badge} read by substation {peer}: {outcome}");
                let reply = Message::new(kind::CARD_OUTCOME).with_object(field::OUTCOME, &outcome)?;
                link.send(&reply).await
            }
            Command::UrnShutdown => {
                self.deactivate();
                self.presenter.print_warning("Urn", "the urn has shut down");
                self.presenter.update();
                link.send_ack().await
            }
            _ => Err(Error::new(Code::UnknownCommand, format!("station cannot handle {command}"))),
        }
    }

    fn has_card_reader(&self) -> bool {
        true
    }

    async fn read_card(&self, badge: &str) -> CardOutcome {
        let voter = self.pending_voter();
        self.handle_badge(badge, voter).await
    }

    fn polls(&self) -> bool {
        true
    }

    async fn poll(&self) {
        keep_alive(self).await;
        if self.is_authenticated() {
            self.refresh_posts().await;
        }
    }

    async fn after_close(&self) {
        if self.is_authenticated() {
            self.broadcast(Command::StationShutdown, true).await;
        }
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collab::LogPresenter;
    use crate::net::SimulatedNetwork;

    fn station() -> Station {
        let network = SimulatedNetwork::new(Duration::from_millis(200));
        let contact = UrnContact::new(
            Arc::new(network.host("10.0.0.2".parse().unwrap())),
            "10.0.0.1:4000".parse().unwrap(),
            "secret",
        );
        Station::new(contact, Arc::new(LogPresenter))
    }

    fn activate(station: &Station, posts: &[&str]) {
        let mut inner = station.inner();
        inner.state = StationState::Active;
        inner.posts = posts.iter().map(|post| PostSlot::new(post.parse().unwrap())).collect();
    }

    fn post_state(state: PostState, badge: &str) -> Message {
        Message::new(kind::POST_STATE)
            .with_text(field::STATE, crate::terminal::post::state_name(state))
            .with_text(field::BADGE, badge)
    }

    #[test]
    fn notifications_update_slots() {
        let station = station();
        activate(&station, &["10.0.1.1:4000"]);
        station
            .post_state_notified("10.0.1.1".parse().unwrap(), post_state(PostState::InUse, "144"))
            .unwrap();
        let slot = station.post("10.0.1.1:4000".parse().unwrap()).unwrap();
        assert_eq!(slot.state, PostState::InUse);
        assert_eq!(slot.badge, "144");

        let err = station
            .post_state_notified("10.0.1.9".parse().unwrap(), post_state(PostState::Active, "NONE"))
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthorized);
    }

    #[tokio::test]
    async fn badge_outcomes_without_posts() {
        let station = station();
        assert!(matches!(station.read_card("144").await, CardOutcome::Rejected(_)));

        activate(&station, &["10.0.1.1:4000"]);
        assert_eq!(station.read_card("144").await, CardOutcome::NoVoterSelected);

        station.select_voter(Person::example()).unwrap();
        // The only Post is inactive.
        assert_eq!(station.read_card("144").await, CardOutcome::NoPostAvailable);
        assert_eq!(station.pending_voter().unwrap().id, "V-0001");
    }

    #[tokio::test]
    async fn assigned_badge_is_in_use() {
        let station = station();
        activate(&station, &["10.0.1.1:4000"]);
        station
            .post_state_notified("10.0.1.1".parse().unwrap(), post_state(PostState::Associated, "144"))
            .unwrap();
        assert_eq!(
            station.read_card("144").await,
            CardOutcome::BadgeInUse("10.0.1.1:4000".parse().unwrap())
        );
    }

    #[test]
    fn forwarded_reads_carry_an_optional_voter() {
        let station = station();
        let bare = Message::new(kind::READ_CARD).with_text(field::BADGE, "144");
        assert_eq!(station.read_card_forwarded(bare).unwrap(), ("144".to_string(), None));

        let with_voter = Message::new(kind::READ_CARD)
            .with_text(field::BADGE, "145")
            .with_object(field::VOTER, &Person::example2())
            .unwrap();
        let (badge, voter) = station.read_card_forwarded(with_voter).unwrap();
        assert_eq!(badge, "145");
        assert_eq!(voter.unwrap().id, "V-0002");
    }

    #[tokio::test]
    async fn revocation_deactivates() {
        let station = station();
        activate(&station, &[]);
        station.select_voter(Person::example()).unwrap();
        station
            .invalid_authentication(Error::new(Code::Unauthorized, "revoked"))
            .await;
        assert_eq!(station.state(), StationState::Inactive);
        assert_eq!(station.pending_voter(), None);
        assert_eq!(station.select_voter(Person::example()).unwrap_err().code(), Code::WrongState);
    }
}
