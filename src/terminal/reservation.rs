use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{Code, Error, Result};

/// Admits one Post reservation at a time.
///
/// A reservation lasts from picking a Post until the association attempt
/// has finished; dropping the [`Reservation`] ends it on every path.
#[derive(Debug, Clone)]
pub struct ReservationGate {
    slot: Arc<Semaphore>,
}

/// Proof that the holder is the only caller reserving a Post.
#[derive(Debug)]
pub struct Reservation {
    post: SocketAddr,
    started: Instant,
    _permit: OwnedSemaphorePermit,
}

impl Default for ReservationGate {
    fn default() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }
}

impl ReservationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reserving(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Wait until no other caller holds the gate.
    pub async fn admit(&self) -> Result<Admission> {
        let permit = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::new(Code::Invariant, e.to_string()))?;
        Ok(Admission { permit })
    }

    /// Wait for the gate, then pick one of `candidates` uniformly at random
    /// among those for which `reachable` confirms the Post is free.
    ///
    /// Returns `None`, with the gate released, if no candidate qualifies.
    pub async fn reserve<F, Fut>(&self, candidates: Vec<SocketAddr>, reachable: F) -> Result<Option<Reservation>>
    where
        F: FnMut(SocketAddr) -> Fut,
        Fut: Future<Output = bool>,
    {
        Ok(self.admit().await?.reserve(candidates, reachable).await)
    }
}

/// Exclusive use of the gate, before a Post has been picked.
///
/// Checks made while holding it cannot be invalidated by another check-in.
#[derive(Debug)]
pub struct Admission {
    permit: OwnedSemaphorePermit,
}

impl Admission {
    /// Pick a Post, keeping the gate if one is found.
    pub async fn reserve<F, Fut>(self, mut candidates: Vec<SocketAddr>, mut reachable: F) -> Option<Reservation>
    where
        F: FnMut(SocketAddr) -> Fut,
        Fut: Future<Output = bool>,
    {
        // Shuffle so that low-index Posts are not favoured.
        candidates.shuffle(&mut rand::thread_rng());
        for post in candidates {
            if reachable(post).await {
                trace!("Reserved post {post}");
                return Some(Reservation {
                    post,
                    started: Instant::now(),
                    _permit: self.permit,
                });
            }
            debug!("Post {post} is not available, trying the next one");
        }
        None
    }
}

impl Reservation {
    pub fn post(&self) -> SocketAddr {
        self.post
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        trace!(
            "Reservation of post {} ended after {:?}",
            self.post,
            self.started.elapsed()
        );
    }
}
