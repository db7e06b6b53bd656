use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// A task run repeatedly at a fixed interval until stopped.
///
/// Stopping interrupts the wait between runs; a run already in progress is
/// given `join_timeout` to finish before it is aborted.
pub struct PeriodicTask {
    handle: JoinHandle<()>,
    signal: Arc<Notify>,
    name: &'static str,
}

impl PeriodicTask {
    /// Run `task` every `interval`, the first time after one full interval.
    pub fn new<F, Fut>(name: &'static str, interval: Duration, mut task: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Create the synchronisation signal.
        let signal = Arc::new(Notify::new());

        // Spawn the loop, waiting on either the next tick or the signal.
        let task_signal = signal.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_signal.notified() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = task_signal.notified() => break,
                    _ = task() => {}
                }
            }
            trace!("Periodic task `{name}` stopped");
        });

        Self {
            handle,
            signal,
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task to stop and wait for it, aborting it after `join_timeout`.
    pub async fn stop(mut self, join_timeout: Duration) {
        self.signal.notify_one();
        match time::timeout(join_timeout, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if e.is_panic() {
                    error!("Periodic task `{}` panicked: {e}", self.name);
                }
            }
            Err(_) => {
                warn!("Periodic task `{}` did not stop within {join_timeout:?}, aborting", self.name);
                self.handle.abort();
            }
        }
    }
}
