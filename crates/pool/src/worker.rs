//! Pooled workers.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine::InteractiveSession;
use serde::Serialize;

/// Pool-unique worker identifier, assigned in launch order.
pub type WorkerId = u32;

/// Worker lifecycle.
///
/// `Created → Warming → Idle ⇄ Leased → Retired`. `Retired` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Warming = 1,
    Idle = 2,
    Leased = 3,
    Retired = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Created,
            1 => WorkerState::Warming,
            2 => WorkerState::Idle,
            3 => WorkerState::Leased,
            _ => WorkerState::Retired,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Created => "created",
            WorkerState::Warming => "warming",
            WorkerState::Idle => "idle",
            WorkerState::Leased => "leased",
            WorkerState::Retired => "retired",
        };
        f.write_str(name)
    }
}

/// One interactive subprocess owned by the pool.
pub struct Worker {
    id: WorkerId,
    session: Arc<InteractiveSession>,
    state: AtomicU8,
    uses: AtomicU64,
    created_at: Instant,
    /// Milliseconds after `created_at` when the worker last became idle.
    idle_since_ms: AtomicU64,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, session: Arc<InteractiveSession>) -> Self {
        Self {
            id,
            session,
            state: AtomicU8::new(WorkerState::Created as u8),
            uses: AtomicU64::new(0),
            created_at: Instant::now(),
            idle_since_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn session(&self) -> &Arc<InteractiveSession> {
        &self.session
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `next` unless the worker is already retired.
    ///
    /// Returns the previous state.
    pub(crate) fn transition(&self, next: WorkerState) -> WorkerState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == WorkerState::Retired as u8 {
                return WorkerState::Retired;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return WorkerState::from_u8(previous),
                Err(actual) => current = actual,
            }
        }
    }

    /// Marks the worker retired. Returns false if it already was.
    pub(crate) fn retire(&self) -> bool {
        self.state.swap(WorkerState::Retired as u8, Ordering::AcqRel) != WorkerState::Retired as u8
    }

    /// Completed leases.
    pub fn uses(&self) -> u64 {
        self.uses.load(Ordering::Acquire)
    }

    /// Records a finished lease and returns the new count.
    pub(crate) fn record_use(&self) -> u64 {
        self.uses.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Starts the idle clock; called whenever the worker joins the idle queue.
    pub(crate) fn mark_idle(&self) {
        self.idle_since_ms
            .store(self.age().as_millis() as u64, Ordering::Release);
    }

    /// Time since the worker last joined the idle queue.
    pub fn idle_for(&self) -> Duration {
        let now = self.age().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.idle_since_ms.load(Ordering::Acquire)))
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pid", &self.session.pid())
            .field("state", &self.state())
            .field("uses", &self.uses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{ProcessEngine, SessionSpec};

    async fn worker() -> Worker {
        let session = ProcessEngine::new()
            .start_session(&SessionSpec::new(["/bin/sh"]))
            .unwrap();
        Worker::new(7, session)
    }

    #[tokio::test]
    async fn test_new_worker() {
        let worker = worker().await;

        assert_eq!(worker.id(), 7);
        assert_eq!(worker.state(), WorkerState::Created);
        assert_eq!(worker.uses(), 0);
        assert!(worker.is_alive());

        worker.session().close().await.unwrap();
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn test_transitions() {
        let worker = worker().await;

        assert_eq!(worker.transition(WorkerState::Warming), WorkerState::Created);
        assert_eq!(worker.transition(WorkerState::Idle), WorkerState::Warming);
        assert_eq!(worker.transition(WorkerState::Leased), WorkerState::Idle);
        assert_eq!(worker.state(), WorkerState::Leased);

        worker.session().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retired_is_terminal() {
        let worker = worker().await;

        assert!(worker.retire());
        assert!(!worker.retire());
        assert_eq!(worker.transition(WorkerState::Idle), WorkerState::Retired);
        assert_eq!(worker.state(), WorkerState::Retired);

        worker.session().kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_record_use() {
        let worker = worker().await;

        assert_eq!(worker.record_use(), 1);
        assert_eq!(worker.record_use(), 2);
        assert_eq!(worker.uses(), 2);

        worker.session().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_clock_restarts() {
        let worker = worker().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(worker.idle_for() >= Duration::from_millis(50));

        worker.mark_idle();
        assert!(worker.idle_for() < Duration::from_millis(50));
        assert!(worker.age() >= Duration::from_millis(50));

        worker.session().close().await.unwrap();
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Leased.to_string(), "leased");
        assert_eq!(WorkerState::from_u8(4), WorkerState::Retired);
    }
}
