use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::timeout;

use crate::error::{Code, Error, Result};
use crate::logging::{log_request, log_response, LinkCounter};
use crate::net::{Acceptor, Link, Network};
use crate::protocol::Command;

/// The terminal-specific handler for accepted connections.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Is the terminal at `peer` allowed to issue `command`?
    fn accepts(&self, command: Command, peer: IpAddr) -> bool;

    /// Handle one command. The link is closed afterwards regardless of outcome.
    async fn serve(&self, command: Command, link: &mut Link) -> Result<()>;
}

/// Accepts links and hands each one to a [`Service`] on a bounded pool of tasks.
///
/// Built in two steps so the service can hold a handle to the server:
/// [`Server::bind`], then [`Server::start`].
pub struct Server {
    local_addr: SocketAddr,
    acceptor: Mutex<Option<Box<dyn Acceptor>>>,
    workers: usize,
    grace_period: Duration,
    stop: Arc<Notify>,
    accept_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Listen on `addr`. Nothing is accepted until [`Server::start`].
    pub async fn bind(
        network: &dyn Network,
        addr: SocketAddr,
        workers: usize,
        grace_period: Duration,
    ) -> Result<Self> {
        let acceptor = network.listen(addr).await?;
        Ok(Self {
            local_addr: acceptor.local_addr(),
            acceptor: Mutex::new(Some(acceptor)),
            workers: workers.max(1),
            grace_period,
            stop: Arc::new(Notify::new()),
            accept_loop: Default::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Begin accepting. Fails if already started or shut down.
    pub async fn start(&self, service: Arc<dyn Service>) -> Result<()> {
        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::wrong_state(format!("server on {} already started", self.local_addr)))?;

        info!("Accepting connections on {} with {} workers", self.local_addr, self.workers);
        let handle = tokio::spawn(accept_loop(
            acceptor,
            service,
            Arc::new(Semaphore::new(self.workers)),
            self.stop.clone(),
            self.grace_period,
        ));
        *self.accept_loop.lock().await = Some(handle);
        Ok(())
    }

    /// Stop accepting, let running handlers finish within the grace period,
    /// then cancel the rest. Safe to call repeatedly.
    pub async fn shut_down(&self) {
        // Drop an acceptor that was never started.
        self.acceptor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let Some(handle) = self.accept_loop.lock().await.take() else {
            return;
        };
        info!("Stopping server on {}", self.local_addr);
        self.stop.notify_one();
        if let Err(e) = handle.await {
            error!("Accept loop on {} failed: {e}", self.local_addr);
        }
    }
}

async fn accept_loop(
    mut acceptor: Box<dyn Acceptor>,
    service: Arc<dyn Service>,
    pool: Arc<Semaphore>,
    stop: Arc<Notify>,
    grace_period: Duration,
) {
    let local_addr = acceptor.local_addr();
    let counter = Arc::new(LinkCounter::new(local_addr));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => report_join(joined),
            accepted = accept_with_permit(acceptor.as_mut(), &pool) => match accepted {
                Ok((link, permit)) => {
                    tasks.spawn(serve_connection(link, service.clone(), counter.clone(), permit));
                }
                Err(e) if e.code() == Code::ListenerClosed => {
                    warn!("Listener on {local_addr} closed: {e}");
                    break;
                }
                Err(e) => warn!("Failed to accept a connection on {local_addr}: {e}"),
            },
        }
    }

    // Stop listening before draining.
    drop(acceptor);

    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            report_join(joined);
        }
    };
    if timeout(grace_period, drain).await.is_err() {
        warn!(
            "{} connection(s) on {local_addr} still running after {:?}, cancelling",
            tasks.len(),
            grace_period
        );
        tasks.shutdown().await;
    }
}

async fn accept_with_permit(
    acceptor: &mut dyn Acceptor,
    pool: &Arc<Semaphore>,
) -> Result<(Link, OwnedSemaphorePermit)> {
    let permit = pool
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| Error::new(Code::Invariant, e.to_string()))?;
    let link = acceptor.accept().await?;
    Ok((link, permit))
}

fn report_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Connection handler panicked: {e}");
        }
    }
}

/// Read the command, dispatch it, report failures to the peer, then close.
async fn serve_connection(
    mut link: Link,
    service: Arc<dyn Service>,
    counter: Arc<LinkCounter>,
    _permit: OwnedSemaphorePermit,
) {
    let tag = counter.tag();
    let peer = link.peer();

    let result = match link.receive_command().await {
        Ok(command) => {
            log_request(tag, command, peer.ip());
            if service.accepts(command, peer.ip()) {
                service.serve(command, &mut link).await
            } else {
                Err(Error::new(
                    Code::Unauthorized,
                    format!("{} may not issue {command}", peer.ip()),
                ))
            }
        }
        Err(e) => Err(e),
    };

    log_response(tag, &result);
    if let Err(err) = &result {
        if !err.is_connection() && !link.is_closed() {
            if let Err(e) = link.send_error(err).await {
                debug!("[{tag}] could not report error to {peer}: {e}");
            }
        }
    }
    link.close().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::net::SimulatedNetwork;
    use crate::protocol::Message;

    const SERVER: &str = "10.0.0.1:4000";
    const CLIENT: &str = "10.0.0.2";

    /// Echoes the `n` field back, or sleeps on `postStateReq`.
    struct Echo {
        served: AtomicUsize,
    }

    #[async_trait]
    impl Service for Echo {
        fn accepts(&self, command: Command, _peer: IpAddr) -> bool {
            command != Command::UrnShutdown
        }

        async fn serve(&self, command: Command, link: &mut Link) -> Result<()> {
            self.served.fetch_add(1, Ordering::SeqCst);
            match command {
                Command::PostState => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
                Command::ResetPost => Err(Error::wrong_state("nothing to reset")),
                _ => {
                    let message = link.receive().await?.verify("echo", &[])?;
                    let reply = Message::new("echo").with_int("n", message.int("n")?);
                    link.send(&reply).await
                }
            }
        }
    }

    async fn server(network: &SimulatedNetwork, grace: Duration) -> (Server, Arc<Echo>) {
        let addr: SocketAddr = SERVER.parse().unwrap();
        let server = Server::bind(&network.host(addr.ip()), addr, 2, grace)
            .await
            .unwrap();
        let echo = Arc::new(Echo {
            served: AtomicUsize::new(0),
        });
        server.start(echo.clone()).await.unwrap();
        (server, echo)
    }

    async fn request(network: &SimulatedNetwork, command: Command, n: i64) -> Result<i64> {
        let mut link = network
            .host(CLIENT.parse().unwrap())
            .connect(SERVER.parse().unwrap())
            .await?;
        link.send_command(command).await?;
        link.send(&Message::new("echo").with_int("n", n)).await?;
        let reply = link.receive().await?.verify("echo", &[])?;
        reply.int("n")
    }

    #[tokio::test]
    async fn dispatches_and_reports_errors() {
        let network = SimulatedNetwork::new(Duration::from_secs(1));
        let (server, echo) = server(&network, Duration::from_secs(1)).await;

        assert_eq!(request(&network, Command::Ballots, 5).await.unwrap(), 5);
        let err = request(&network, Command::ResetPost, 1).await.unwrap_err();
        assert_eq!(err.code(), Code::WrongState);
        let err = request(&network, Command::UrnShutdown, 1).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthorized);
        assert_eq!(echo.served.load(Ordering::SeqCst), 2);

        server.shut_down().await;
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let network = SimulatedNetwork::new(Duration::from_secs(1));
        let (server, echo) = server(&network, Duration::from_secs(1)).await;
        assert!(server.start(echo).await.is_err());
        server.shut_down().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_stragglers_and_is_idempotent() {
        let network = SimulatedNetwork::new(Duration::from_secs(60));
        let (server, echo) = server(&network, Duration::from_millis(100)).await;

        let mut link = network
            .host(CLIENT.parse().unwrap())
            .connect(SERVER.parse().unwrap())
            .await
            .unwrap();
        link.send_command(Command::PostState).await.unwrap();
        while echo.served.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = tokio::time::Instant::now();
        server.shut_down().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        server.shut_down().await;

        assert!(!network.is_listening(SERVER.parse().unwrap()));
        // The cancelled handler dropped its link.
        assert!(link.read_line().await.is_err());
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let network = SimulatedNetwork::new(Duration::from_secs(60));
        let (server, echo) = server(&network, Duration::from_millis(50)).await;
        let host = network.host(CLIENT.parse().unwrap());

        // Two sleeping handlers fill the pool of two.
        let mut sleepers = Vec::new();
        for _ in 0..2 {
            let mut link = host.connect(SERVER.parse().unwrap()).await.unwrap();
            link.send_command(Command::PostState).await.unwrap();
            sleepers.push(link);
        }
        while echo.served.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut third = host.connect(SERVER.parse().unwrap()).await.unwrap();
        third.send_command(Command::PostState).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(echo.served.load(Ordering::SeqCst), 2);

        server.shut_down().await;
    }

    /// Fails with a dropped connection, then reports the listener closed.
    struct Closing {
        addr: SocketAddr,
        accepts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Acceptor for Closing {
        async fn accept(&mut self) -> Result<Link> {
            match self.accepts.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::new(Code::Dropped, "connection reset by peer")),
                _ => Err(Error::new(Code::ListenerClosed, "listener closed")),
            }
        }

        fn local_addr(&self) -> SocketAddr {
            self.addr
        }
    }

    #[tokio::test]
    async fn closed_listener_ends_the_accept_loop() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let acceptor = Closing {
            addr: SERVER.parse().unwrap(),
            accepts: accepts.clone(),
        };
        let echo = Arc::new(Echo {
            served: AtomicUsize::new(0),
        });
        let looping = accept_loop(
            Box::new(acceptor),
            echo,
            Arc::new(Semaphore::new(1)),
            Arc::new(Notify::new()),
            Duration::from_millis(50),
        );
        timeout(Duration::from_secs(5), looping).await.unwrap();
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }
}
