use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::{Code, Error, Result};
use crate::protocol::{Command, Message, MessageState};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Closes a [`Link`] from another task, waking any blocked reader.
#[derive(Debug, Clone, Default)]
pub struct LinkCloser {
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl LinkCloser {
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A duplex, newline-delimited text channel to a single peer.
pub struct Link {
    reader: BufReader<BoxedRead>,
    writer: Option<BoxedWrite>,
    peer: SocketAddr,
    io_timeout: Duration,
    closer: LinkCloser,
}

impl Link {
    pub fn new<R, W>(reader: R, writer: W, peer: SocketAddr, io_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Some(Box::new(writer)),
            peer,
            io_timeout,
            closer: LinkCloser::default(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn closer(&self) -> LinkCloser {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed() || self.writer.is_none()
    }

    fn dropped(&self, reason: &str) -> Error {
        Error::new(Code::Dropped, format!("link to {}: {reason}", self.peer))
    }

    /// Write one line; the newline is appended here.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        if self.closer.is_closed() {
            return Err(self.dropped("already closed"));
        }
        let io_timeout = self.io_timeout;
        let peer = self.peer;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::new(Code::Dropped, format!("link to {peer}: already closed")))?;
        timeout(io_timeout, async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        })
        .await??;
        Ok(())
    }

    /// Read one line, without its terminator.
    ///
    /// Fails if the peer hangs up, the read times out, or the link is closed
    /// while waiting.
    pub async fn read_line(&mut self) -> Result<String> {
        let notified = self.closer.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.closer.is_closed() {
            return Err(self.dropped("already closed"));
        }

        let mut line = String::new();
        let read = tokio::select! {
            biased;
            _ = &mut notified => None,
            read = timeout(self.io_timeout, self.reader.read_line(&mut line)) => Some(read),
        };
        let Some(read) = read else {
            return Err(self.dropped("closed while reading"));
        };
        match read {
            Err(_) => Err(Error::new(
                Code::Timeout,
                format!("link to {}: no data within {:?}", self.peer, self.io_timeout),
            )),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Err(self.dropped("closed by peer")),
            Ok(Ok(_)) => {
                let trimmed = line.trim_end_matches(&['\n', '\r'][..]).len();
                line.truncate(trimmed);
                Ok(line)
            }
        }
    }

    /// Is there more data to read? Waits for data, end of stream or the I/O timeout.
    pub async fn has_next(&mut self) -> bool {
        if self.closer.is_closed() {
            return false;
        }
        match timeout(self.io_timeout, self.reader.fill_buf()).await {
            Ok(Ok(buffer)) => !buffer.is_empty(),
            _ => false,
        }
    }

    /// Release the underlying I/O. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.closer.close();
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                trace!("Error shutting down link to {}: {e}", self.peer);
            }
        }
    }

    pub async fn send_command(&mut self, command: Command) -> Result<()> {
        self.write_line(command.as_str()).await
    }

    pub async fn receive_command(&mut self) -> Result<Command> {
        self.read_line().await?.parse()
    }

    pub async fn send<S: MessageState>(&mut self, message: &Message<S>) -> Result<()> {
        let line = message.to_wire()?;
        self.write_line(&line).await
    }

    pub async fn receive(&mut self) -> Result<Message> {
        Message::from_wire(&self.read_line().await?)
    }

    pub async fn send_ack(&mut self) -> Result<()> {
        self.send(&Message::ack()).await
    }

    pub async fn send_error(&mut self, err: &Error) -> Result<()> {
        self.send(&Message::error(err)).await
    }
}
