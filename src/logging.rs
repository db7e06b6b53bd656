use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use log::Level;

use crate::error::{Error, ErrorKind};
use crate::protocol::Command;

/// Name of the dynamic filter guarding the liveness poller's log output.
pub const LIVENESS_FILTER: &str = "liveness";

/// Names one accepted link in the log: the listening address and the
/// link's sequence number on it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LinkTag {
    listener: SocketAddr,
    seq: u64,
}

impl Display for LinkTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.listener, self.seq)
    }
}

/// Numbers the links one server accepts, from 1.
#[derive(Debug)]
pub struct LinkCounter {
    listener: SocketAddr,
    accepted: AtomicU64,
}

impl LinkCounter {
    pub fn new(listener: SocketAddr) -> Self {
        Self {
            listener,
            accepted: AtomicU64::new(0),
        }
    }

    pub fn tag(&self) -> LinkTag {
        LinkTag {
            listener: self.listener,
            seq: self.accepted.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// Log an incoming command. Liveness checks log at debug level.
pub fn log_request(tag: LinkTag, command: Command, peer: impl Display) {
    let level = if command == Command::CheckAuthentication {
        Level::Debug
    } else {
        Level::Info
    };
    log!(level, "[{tag}] {command} from {peer}");
}

pub fn log_response(tag: LinkTag, result: &Result<(), Error>) {
    match result {
        Ok(()) => debug!("[{tag}] done"),
        Err(err) => match err.kind() {
            ErrorKind::Internal | ErrorKind::Persistence => error!("[{tag}] {err}"),
            _ => warn!("[{tag}] {err}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_count_per_listener() {
        let urn = LinkCounter::new("10.0.0.1:4000".parse().unwrap());
        let post = LinkCounter::new("10.0.1.1:4000".parse().unwrap());
        assert_eq!(urn.tag().to_string(), "10.0.0.1:4000#1");
        assert_eq!(urn.tag().to_string(), "10.0.0.1:4000#2");
        assert_eq!(post.tag().to_string(), "10.0.1.1:4000#1");
        assert_eq!(urn.accepted(), 2);
    }
}
