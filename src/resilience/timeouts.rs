//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound how long a caller waits on a resource fetch
//! - Let the owner cancel the deadline once the fetch settles
//!
//! # Design Decisions
//! - Racing never cancels the raced future; a caller that wants the work to
//!   outlive the deadline races a `JoinHandle`
//! - A cancelled guard never fires
//! - Timeout errors are distinct from fetch errors

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// The guard's deadline passed before the raced future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Deadline of {}ms elapsed", .after.as_millis())]
pub struct Elapsed {
    pub after: Duration,
}

/// A cancellable delay.
#[derive(Debug, Clone)]
pub struct TimeoutGuard {
    duration: Duration,
    cancelled: Arc<watch::Sender<bool>>,
}

impl TimeoutGuard {
    pub fn new(duration: Duration) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            duration,
            cancelled: Arc::new(cancelled),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Wait out the delay. Returns `false` as soon as the guard is cancelled.
    pub async fn fired(&self) -> bool {
        let mut cancelled = self.cancelled.subscribe();
        if *cancelled.borrow_and_update() {
            return false;
        }

        let cancellation = async {
            while cancelled.changed().await.is_ok() {
                if *cancelled.borrow_and_update() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(self.duration) => !self.is_cancelled(),
            _ = cancellation => false,
        }
    }

    /// Race a future against the delay.
    ///
    /// If the guard is cancelled while the future is pending, the race keeps
    /// waiting on the future alone.
    pub async fn race<F: Future>(&self, future: F) -> Result<F::Output, Elapsed> {
        tokio::pin!(future);

        let fired = tokio::select! {
            biased;
            output = &mut future => {
                self.cancel();
                return Ok(output);
            }
            fired = self.fired() => fired,
        };

        if fired {
            tracing::debug!(timeout_ms = self.duration.as_millis() as u64, "Timeout guard fired");
            Err(Elapsed { after: self.duration })
        } else {
            Ok(future.await)
        }
    }
}
