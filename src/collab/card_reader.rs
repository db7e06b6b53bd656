use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::{Code, Error, Result};

/// What happened when a badge was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "camelCase")]
pub enum CardOutcome {
    /// The selected voter was assigned to this Post.
    Associated(SocketAddr),
    /// The voter has finished and this Post is free again.
    Released(SocketAddr),
    /// The badge unlocked the Post it was assigned to.
    VotingStarted,
    /// The badge is already assigned to this Post.
    BadgeInUse(SocketAddr),
    NoVoterSelected,
    NoPostAvailable,
    Rejected(String),
}

impl Display for CardOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Associated(post) => write!(f, "voter associated with post {post}"),
            Self::Released(post) => write!(f, "post {post} released"),
            Self::VotingStarted => write!(f, "voting started"),
            Self::BadgeInUse(post) => write!(f, "badge already in use on post {post}"),
            Self::NoVoterSelected => write!(f, "no voter selected"),
            Self::NoPostAvailable => write!(f, "no post available"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// Reacts to badge reads.
#[async_trait]
pub trait BadgeHandler: Send + Sync + 'static {
    async fn read_card(&self, badge: &str) -> CardOutcome;
}

type Swipe = (String, oneshot::Sender<CardOutcome>);

/// The task owning the physical reader. Reads are handled one at a time.
pub struct CardReader {
    task: JoinHandle<()>,
    signal: Arc<Notify>,
}

/// Delivers badge reads to a running [`CardReader`].
#[derive(Clone)]
pub struct CardReaderHandle {
    swipes: mpsc::Sender<Swipe>,
}

impl CardReader {
    pub fn spawn(handler: Arc<dyn BadgeHandler>) -> (Self, CardReaderHandle) {
        let (sender, mut receiver) = mpsc::channel::<Swipe>(1);
        let signal = Arc::new(Notify::new());
        let task_signal = signal.clone();
        let task = tokio::spawn(async move {
            loop {
                let (badge, reply) = tokio::select! {
                    _ = task_signal.notified() => break,
                    swipe = receiver.recv() => match swipe {
                        Some(swipe) => swipe,
                        None => break,
                    },
                };
                let outcome = handler.read_card(&badge).await;
                debug!("Badge {badge}: {outcome}");
                // The swiper may have given up waiting.
                let _ = reply.send(outcome);
            }
            trace!("Card reader stopped");
        });
        (Self { task, signal }, CardReaderHandle { swipes: sender })
    }

    /// Stop reading. A read in progress gets `join_timeout` to finish.
    pub async fn stop(mut self, join_timeout: Duration) {
        self.signal.notify_one();
        if tokio::time::timeout(join_timeout, &mut self.task).await.is_err() {
            warn!("Card reader still busy after {join_timeout:?}, aborting");
            self.task.abort();
        }
    }
}

impl CardReaderHandle {
    /// Read `badge` and wait for the outcome.
    pub async fn swipe(&self, badge: impl Into<String>) -> Result<CardOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.swipes
            .send((badge.into(), reply))
            .await
            .map_err(|_| Error::new(Code::Dropped, "card reader is not running"))?;
        outcome
            .await
            .map_err(|_| Error::new(Code::Dropped, "card reader stopped while reading"))
    }
}
