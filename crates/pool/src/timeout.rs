//! Per-lease request deadlines.
//!
//! Each armed timer owns an entry in a concurrent map. Expiry and
//! [`cancel`](RequestTimeoutScheduler::cancel) both try to remove that entry;
//! whichever removes it decides the outcome, so a deadline fires at most
//! once and never after a successful cancel. Timers run on a
//! [`TaskTracker`]; after [`close`](RequestTimeoutScheduler::close) no new
//! expiry starts and [`wait`](RequestTimeoutScheduler::wait) returns once
//! the ones already running have finished.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug)]
struct Timer {
    generation: u64,
    cancel: CancellationToken,
}

/// Arms and disarms lease deadlines.
#[derive(Debug)]
pub struct RequestTimeoutScheduler {
    timers: Arc<DashMap<Uuid, Timer>>,
    next_generation: AtomicU64,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl RequestTimeoutScheduler {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Runs `on_expire` after `after` unless cancelled first.
    ///
    /// Re-scheduling an armed lease replaces its timer. Returns false once
    /// the scheduler is closed. Must be called within a tokio runtime.
    pub fn schedule<F>(&self, lease_id: Uuid, after: Duration, on_expire: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.root.child_token();
        if let Some(previous) = self.timers.insert(
            lease_id,
            Timer {
                generation,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }

        // Lost a race with close().
        if self.root.is_cancelled() {
            self.timers
                .remove_if(&lease_id, |_, timer| timer.generation == generation);
            return false;
        }

        let timers = Arc::clone(&self.timers);
        let root = self.root.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let owned = timers
                        .remove_if(&lease_id, |_, timer| timer.generation == generation)
                        .is_some();
                    // Closed after the timer won its entry.
                    if owned && !root.is_cancelled() {
                        trace!(lease_id = %lease_id, "Request deadline fired");
                        on_expire.await;
                    }
                }
            }
        });
        true
    }

    /// Disarms the timer for `lease_id`.
    ///
    /// Returns true iff the timer was removed before it fired.
    pub fn cancel(&self, lease_id: &Uuid) -> bool {
        match self.timers.remove(lease_id) {
            Some((_, timer)) => {
                timer.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Armed timers.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Cancels every timer; later calls to `schedule` are ignored.
    pub fn close(&self) {
        self.root.cancel();
        self.timers.clear();
        self.tracker.close();
    }

    /// Waits for timer tasks to finish, including an expiry that was
    /// already running when the scheduler closed. Only returns after `close`.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for RequestTimeoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTimeoutScheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
