use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Code, Error, Result};
use crate::net::{Acceptor, Link, Network};

const PIPE_CAPACITY: usize = 64 * 1024;
const BACKLOG: usize = 64;

#[derive(Default)]
struct Registry {
    listeners: HashMap<SocketAddr, mpsc::Sender<Link>>,
    partitioned: HashSet<IpAddr>,
}

/// An in-process network of IP-addressed hosts connected by pipes.
///
/// Each test builds its own; hosts obtained with [`SimulatedNetwork::host`]
/// share its routing table.
#[derive(Clone)]
pub struct SimulatedNetwork {
    registry: Arc<Mutex<Registry>>,
    next_port: Arc<AtomicU16>,
    io_timeout: Duration,
}

impl SimulatedNetwork {
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            registry: Default::default(),
            next_port: Arc::new(AtomicU16::new(40_000)),
            io_timeout,
        }
    }

    /// The network as seen from the host at `ip`.
    pub fn host(&self, ip: IpAddr) -> SimulatedHost {
        SimulatedHost {
            network: self.clone(),
            ip,
        }
    }

    /// Cut `ip` off: new connections from or to it fail.
    pub fn partition(&self, ip: IpAddr) {
        debug!("Partitioning {ip} from the simulated network");
        self.registry().partitioned.insert(ip);
    }

    pub fn heal(&self, ip: IpAddr) {
        debug!("Reconnecting {ip} to the simulated network");
        self.registry().partitioned.remove(&ip);
    }

    pub fn is_listening(&self, addr: SocketAddr) -> bool {
        self.registry().listeners.contains_key(&addr)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // The registry holds no invariants a panicking holder could break.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ephemeral_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }
}

/// One host on a [`SimulatedNetwork`].
#[derive(Clone)]
pub struct SimulatedHost {
    network: SimulatedNetwork,
    ip: IpAddr,
}

impl SimulatedHost {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

#[async_trait]
impl Network for SimulatedHost {
    async fn connect(&self, addr: SocketAddr) -> Result<Link> {
        let io_timeout = self.network.io_timeout;
        let listener = {
            let registry = self.network.registry();
            if registry.partitioned.contains(&self.ip) || registry.partitioned.contains(&addr.ip()) {
                return Err(Error::unreachable(addr, "network partitioned"));
            }
            registry
                .listeners
                .get(&addr)
                .cloned()
                .ok_or_else(|| Error::unreachable(addr, "connection refused"))?
        };

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let source = SocketAddr::new(self.ip, self.network.ephemeral_port());
        let server_link = Link::new(server_read, server_write, source, io_timeout);

        listener
            .send(server_link)
            .await
            .map_err(|_| Error::unreachable(addr, "listener closed"))?;
        Ok(Link::new(client_read, client_write, addr, io_timeout))
    }

    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Acceptor>> {
        if addr.ip() != self.ip {
            return Err(Error::new(
                Code::Bind,
                format!("host {} cannot listen on {addr}", self.ip),
            ));
        }
        let (sender, receiver) = mpsc::channel(BACKLOG);
        let mut registry = self.network.registry();
        if registry.listeners.contains_key(&addr) {
            return Err(Error::new(Code::Bind, format!("{addr} is already in use")));
        }
        registry.listeners.insert(addr, sender);
        Ok(Box::new(SimulatedAcceptor {
            network: self.network.clone(),
            addr,
            incoming: receiver,
        }))
    }
}

struct SimulatedAcceptor {
    network: SimulatedNetwork,
    addr: SocketAddr,
    incoming: mpsc::Receiver<Link>,
}

#[async_trait]
impl Acceptor for SimulatedAcceptor {
    async fn accept(&mut self) -> Result<Link> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| Error::new(Code::ListenerClosed, format!("listener on {} closed", self.addr)))
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for SimulatedAcceptor {
    fn drop(&mut self) {
        self.network.registry().listeners.remove(&self.addr);
    }
}
