//! Transport: links, networks that produce them, and the connection dispatcher.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;

pub mod link;
pub mod server;
pub mod simulated;
pub mod tcp;
pub mod tls;

pub use link::{Link, LinkCloser};
pub use server::{Server, Service};
pub use simulated::SimulatedNetwork;
pub use tcp::TcpNetwork;
pub use tls::TlsSettings;

/// Something able to open links to, and accept links from, other terminals.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// Open a link to `addr`. Failure is a connection error naming `addr`.
    async fn connect(&self, addr: SocketAddr) -> Result<Link>;

    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Acceptor>>;
}

/// The accepting end of a listening socket.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> Result<Link>;

    fn local_addr(&self) -> SocketAddr;
}
