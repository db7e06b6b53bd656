//! A complete polling place on a simulated network, for tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{KeepAlive, UrnContact};
use crate::collab::memory_store::examples::*;
use crate::collab::{LogPresenter, MemoryStore, Presenter, StoreSeed};
use crate::crypto::asymmetric::examples::{booth, counting_authority};
use crate::net::{Network, SimulatedNetwork};
use crate::terminal::{Post, RunnerSettings, Station, SubStation, TerminalRunner, Urn};

pub(crate) const IO_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) fn init_logging() {
    log4rs_test_utils::test_logging::init_logging_once_for(["evote_terminals"], None, None);
}

pub(crate) fn network() -> SimulatedNetwork {
    SimulatedNetwork::new(IO_TIMEOUT)
}

/// Pollers are effectively off; tests drive liveness explicitly.
pub(crate) fn settings() -> RunnerSettings {
    RunnerSettings {
        workers: 4,
        grace_period: Duration::from_millis(200),
        poll_interval: Duration::from_secs(3600),
    }
}

pub(crate) fn addr(address: &str) -> SocketAddr {
    address.parse().unwrap()
}

/// One Urn, one Station with its SubStation, and two Posts, all running.
pub(crate) struct World {
    pub network: SimulatedNetwork,
    pub store: Arc<MemoryStore>,
    pub urn: TerminalRunner<Urn>,
    pub station: TerminalRunner<Station>,
    pub substation: TerminalRunner<SubStation>,
    pub posts: Vec<TerminalRunner<Post>>,
}

impl World {
    /// Start every terminal. The Urn has its session open; nobody is authenticated.
    pub async fn build(network: SimulatedNetwork) -> Self {
        let store = Arc::new(MemoryStore::new(StoreSeed::example()).unwrap());
        let presenter: Arc<dyn Presenter> = Arc::new(LogPresenter);
        let host = |address: &str| -> Arc<dyn Network> { Arc::new(network.host(addr(address).ip())) };
        let contact = |address: &str| UrnContact::new(host(address), addr(URN), secret_for(address));

        let urn = Urn::new(
            host(URN),
            store.clone(),
            counting_authority().public().clone(),
            presenter.clone(),
        );
        let urn = TerminalRunner::start(Arc::new(urn), host(URN).as_ref(), addr(URN), settings())
            .await
            .unwrap();
        urn.terminal().select_session(PROCEDURE, SESSION).await.unwrap();

        let station = Station::new(contact(STATION), presenter.clone());
        let station = TerminalRunner::start(Arc::new(station), host(STATION).as_ref(), addr(STATION), settings())
            .await
            .unwrap();

        let substation = SubStation::new(contact(SUBSTATION), presenter.clone());
        let substation = TerminalRunner::start(
            Arc::new(substation),
            host(SUBSTATION).as_ref(),
            addr(SUBSTATION),
            settings(),
        )
        .await
        .unwrap();

        let mut posts = Vec::new();
        for (index, address) in POSTS.iter().enumerate() {
            let post = Post::new(contact(address), booth(index).clone(), presenter.clone());
            let post = TerminalRunner::start(Arc::new(post), host(address).as_ref(), addr(address), settings())
                .await
                .unwrap();
            posts.push(post);
        }

        Self {
            network,
            store,
            urn,
            station,
            substation,
            posts,
        }
    }

    /// Authenticate the Station first, so it accepts the others' notifications.
    pub async fn activate(&self) {
        self.station.terminal().authenticate().await.unwrap();
        self.substation.terminal().authenticate().await.unwrap();
        for post in &self.posts {
            post.terminal().authenticate().await.unwrap();
        }
        self.station.terminal().refresh_posts().await;
    }

    pub fn urn(&self) -> &Urn {
        self.urn.terminal()
    }

    pub fn station(&self) -> &Station {
        self.station.terminal()
    }

    pub fn substation(&self) -> &SubStation {
        self.substation.terminal()
    }

    /// The runner of the Post listening on `address`.
    pub fn post(&self, address: SocketAddr) -> &TerminalRunner<Post> {
        self.posts
            .iter()
            .find(|post| post.local_addr() == address)
            .unwrap()
    }

    /// Shut everything down, the Urn last.
    pub async fn shut_down(&self) {
        for post in &self.posts {
            post.shut_down().await;
        }
        self.substation.shut_down().await;
        self.station.shut_down().await;
        self.urn.shut_down().await;
    }
}
