use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Code, Error, Result};
use crate::net::{Acceptor, Link, Network, TlsSettings};

/// Real sockets, optionally wrapped in mutually authenticated TLS.
#[derive(Clone)]
pub struct TcpNetwork {
    io_timeout: Duration,
    tls: Option<(TlsConnector, TlsAcceptor)>,
}

impl TcpNetwork {
    pub fn plain(io_timeout: Duration) -> Self {
        Self {
            io_timeout,
            tls: None,
        }
    }

    pub fn with_tls(io_timeout: Duration, settings: &TlsSettings) -> Result<Self> {
        Ok(Self {
            io_timeout,
            tls: Some((settings.connector()?, settings.acceptor()?)),
        })
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn connect(&self, addr: SocketAddr) -> Result<Link> {
        let stream = timeout(self.io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::unreachable(addr, "connection timed out"))?
            .map_err(|e| Error::unreachable(addr, e))?;
        stream.set_nodelay(true)?;

        match &self.tls {
            None => {
                let (reader, writer) = stream.into_split();
                Ok(Link::new(reader, writer, addr, self.io_timeout))
            }
            Some((connector, _)) => {
                let stream = timeout(
                    self.io_timeout,
                    connector.connect(ServerName::IpAddress(addr.ip()), stream),
                )
                .await
                .map_err(|_| Error::unreachable(addr, "TLS handshake timed out"))?
                .map_err(|e| Error::unreachable(addr, e))?;
                let (reader, writer) = tokio::io::split(stream);
                Ok(Link::new(reader, writer, addr, self.io_timeout))
            }
        }
    }

    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(Code::Bind, format!("cannot listen on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        Ok(Box::new(TcpAcceptor {
            listener,
            local_addr,
            io_timeout: self.io_timeout,
            tls: self.tls.as_ref().map(|(_, acceptor)| acceptor.clone()),
        }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    io_timeout: Duration,
    tls: Option<TlsAcceptor>,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Link> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        match &self.tls {
            None => {
                let (reader, writer) = stream.into_split();
                Ok(Link::new(reader, writer, peer, self.io_timeout))
            }
            Some(acceptor) => {
                let stream = timeout(self.io_timeout, acceptor.accept(stream))
                    .await?
                    .map_err(|e| {
                        Error::new(Code::Dropped, format!("TLS handshake with {peer} failed: {e}"))
                    })?;
                let (reader, writer) = tokio::io::split(stream);
                Ok(Link::new(reader, writer, peer, self.io_timeout))
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
