//! The terminal runner and the four terminal types.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::collab::{BadgeHandler, CardOutcome, CardReader, CardReaderHandle};
use crate::error::Result;
use crate::model::TerminalKind;
use crate::net::{Link, Network, Server, Service};
use crate::protocol::Command;
use crate::scheduled_task::PeriodicTask;

pub mod post;
pub mod reservation;
pub mod station;
pub mod substation;
pub mod urn;

#[cfg(test)]
mod scenarios;

pub use post::Post;
pub use reservation::{Admission, Reservation, ReservationGate};
pub use station::{PostSlot, Station};
pub use substation::SubStation;
pub use urn::Urn;

/// Message kinds exchanged between terminals once authenticated.
pub mod kind {
    pub const ASSOCIATION: &str = "association";
    pub const RELEASE: &str = "release";
    pub const POST_STATE: &str = "postState";
    pub const NOTICE: &str = "notice";
    pub const READ_CARD: &str = "readCard";
    pub const CARD_OUTCOME: &str = "cardOutcome";
    pub const SEARCH: &str = "searchPerson";
    pub const SEARCH_RESULT: &str = "searchPersonReply";
    pub const BALLOTS_REQUEST: &str = "ballotsRequest";
    pub const VOTE_NONCES: &str = "voteNonces";
    pub const VOTE: &str = "vote";
}

/// Field names shared by the terminal messages.
pub mod field {
    pub const STATION: &str = "station";
    pub const POSTS: &str = "posts";
    pub const SUBSTATIONS: &str = "substations";
    pub const COUNTING_KEY: &str = "countingKey";
    pub const BALLOTS: &str = "ballots";
    pub const PUBLIC_KEY: &str = "publicKey";
    pub const VOTER: &str = "voter";
    pub const BADGE: &str = "badge";
    pub const STATE: &str = "state";
    pub const BALLOT_CODES: &str = "ballotCodes";
    pub const NONCES: &str = "nonces";
    pub const PERSONS: &str = "persons";
    pub const FIRST_NAME: &str = "firstName";
    pub const LAST_NAME: &str = "lastName";
    pub const OUTCOME: &str = "outcome";
}

/// Most voters returned by one search.
pub const MAX_SEARCH_RESULTS: usize = 20;

/// The capabilities a terminal plugs into [`TerminalRunner`].
#[async_trait]
pub trait Terminal: Send + Sync + 'static {
    fn kind(&self) -> TerminalKind;

    /// Runs before connections are accepted. A failure aborts startup.
    async fn before_start(&self) -> Result<()> {
        Ok(())
    }

    /// Runs once the poller, card reader and server have stopped.
    async fn after_close(&self) {}

    /// May the terminal at `peer` issue `command`?
    fn verify_peer_ip(&self, command: Command, peer: IpAddr) -> bool;

    async fn handle(&self, command: Command, link: &mut Link) -> Result<()>;

    fn has_card_reader(&self) -> bool {
        false
    }

    async fn read_card(&self, _badge: &str) -> CardOutcome {
        CardOutcome::Rejected(format!("the {} has no card reader", self.kind()))
    }

    /// Does this terminal run the liveness poller?
    fn polls(&self) -> bool {
        false
    }

    /// One run of the liveness poller.
    async fn poll(&self) {}
}

struct Dispatch<T>(Arc<T>);

#[async_trait]
impl<T: Terminal> Service for Dispatch<T> {
    fn accepts(&self, command: Command, peer: IpAddr) -> bool {
        self.0.verify_peer_ip(command, peer)
    }

    async fn serve(&self, command: Command, link: &mut Link) -> Result<()> {
        self.0.handle(command, link).await
    }
}

#[async_trait]
impl<T: Terminal> BadgeHandler for Dispatch<T> {
    async fn read_card(&self, badge: &str) -> CardOutcome {
        self.0.read_card(badge).await
    }
}

/// Process-level settings shared by every terminal kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub workers: usize,
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workers: 16,
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Runs a [`Terminal`]: its server, its liveness poller and its card reader.
pub struct TerminalRunner<T: Terminal> {
    terminal: Arc<T>,
    server: Server,
    poller: Mutex<Option<PeriodicTask>>,
    card_reader: Mutex<Option<CardReader>>,
    card_handle: Option<CardReaderHandle>,
    grace_period: Duration,
    closed: AtomicBool,
}

impl<T: Terminal> TerminalRunner<T> {
    /// Bind `addr`, prepare the terminal and start everything it needs.
    pub async fn start(
        terminal: Arc<T>,
        network: &dyn Network,
        addr: SocketAddr,
        settings: RunnerSettings,
    ) -> Result<Self> {
        // Bind first so a taken address aborts startup before anything else.
        let server = Server::bind(network, addr, settings.workers, settings.grace_period).await?;
        terminal.before_start().await?;
        server.start(Arc::new(Dispatch(terminal.clone()))).await?;

        let poller = terminal.polls().then(|| {
            let polled = terminal.clone();
            PeriodicTask::new("liveness", settings.poll_interval, move || {
                let polled = polled.clone();
                async move { polled.poll().await }
            })
        });

        let (card_reader, card_handle) = if terminal.has_card_reader() {
            let (reader, handle) = CardReader::spawn(Arc::new(Dispatch(terminal.clone())));
            (Some(reader), Some(handle))
        } else {
            (None, None)
        };

        info!("{} started on {}", terminal.kind(), server.local_addr());
        Ok(Self {
            terminal,
            server,
            poller: Mutex::new(poller),
            card_reader: Mutex::new(card_reader),
            card_handle,
            grace_period: settings.grace_period,
            closed: AtomicBool::new(false),
        })
    }

    pub fn terminal(&self) -> &Arc<T> {
        &self.terminal
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Where badge reads are delivered, if this terminal has a reader.
    pub fn card_reader(&self) -> Option<&CardReaderHandle> {
        self.card_handle.as_ref()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the poller, the card reader and the server, in that order.
    /// Later calls do nothing.
    pub async fn shut_down(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down the {} on {}", self.terminal.kind(), self.local_addr());

        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop(self.grace_period).await;
        }
        if let Some(reader) = self.card_reader.lock().await.take() {
            reader.stop(self.grace_period).await;
        }
        self.server.shut_down().await;
        self.terminal.after_close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::{Code, Error};
    use crate::net::SimulatedNetwork;
    use crate::protocol::{self, Message};

    /// Counts hook calls and answers every command with an ack.
    #[derive(Default)]
    struct Probe {
        started: AtomicUsize,
        closed: AtomicUsize,
        polled: AtomicUsize,
        fail_start: bool,
    }

    #[async_trait]
    impl Terminal for Probe {
        fn kind(&self) -> TerminalKind {
            TerminalKind::Station
        }

        async fn before_start(&self) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(Error::new(Code::Key, "no signing key"));
            }
            Ok(())
        }

        async fn after_close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn verify_peer_ip(&self, command: Command, peer: IpAddr) -> bool {
            command == Command::PostStateNotify && peer == IpAddr::from([10, 0, 1, 1])
        }

        async fn handle(&self, _command: Command, link: &mut Link) -> Result<()> {
            link.receive().await?;
            link.send_ack().await
        }

        fn has_card_reader(&self) -> bool {
            true
        }

        async fn read_card(&self, badge: &str) -> CardOutcome {
            CardOutcome::Rejected(badge.to_string())
        }

        fn polls(&self) -> bool {
            true
        }

        async fn poll(&self) {
            self.polled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings() -> RunnerSettings {
        RunnerSettings {
            workers: 2,
            grace_period: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn runs_hooks_and_shuts_down_once() {
        let network = SimulatedNetwork::new(Duration::from_secs(1));
        let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let probe = Arc::new(Probe::default());
        let runner = TerminalRunner::start(probe.clone(), &network.host(addr.ip()), addr, settings())
            .await
            .unwrap();
        assert_eq!(probe.started.load(Ordering::SeqCst), 1);

        // Peer filtering goes through the terminal.
        let post = network.host("10.0.1.1".parse().unwrap());
        protocol::notify(&post, addr, Command::PostStateNotify, &Message::new("x"))
            .await
            .unwrap();
        let stranger = network.host("10.0.1.9".parse().unwrap());
        let err = protocol::notify(&stranger, addr, Command::PostStateNotify, &Message::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthorized);

        let outcome = runner.card_reader().unwrap().swipe("144").await.unwrap();
        assert_eq!(outcome, CardOutcome::Rejected("144".to_string()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(probe.polled.load(Ordering::SeqCst) >= 1);

        runner.shut_down().await;
        runner.shut_down().await;
        assert!(runner.is_shut_down());
        assert_eq!(probe.closed.load(Ordering::SeqCst), 1);
        assert!(!network.is_listening(addr));
        assert!(runner.card_reader().unwrap().swipe("145").await.is_err());

        // The poller no longer runs.
        let polled = probe.polled.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.polled.load(Ordering::SeqCst), polled);
    }

    #[tokio::test]
    async fn failed_start_releases_the_address() {
        let network = SimulatedNetwork::new(Duration::from_secs(1));
        let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let probe = Arc::new(Probe {
            fail_start: true,
            ..Default::default()
        });
        let err = TerminalRunner::start(probe, &network.host(addr.ip()), addr, settings())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::Key);
        assert!(!network.is_listening(addr));
    }
}
