//! Pool lifecycle events and counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use uuid::Uuid;

use crate::retire::{RetireDecision, RetireReason};
use crate::worker::WorkerId;

/// Capacity of the event broadcast channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the pool.
///
/// Delivered through a broadcast channel; slow subscribers lose the oldest
/// events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A worker finished warming and joined the idle set.
    WorkerCreated { worker_id: WorkerId, pid: Option<u32> },
    /// A worker was removed from the pool.
    WorkerRetired {
        worker_id: WorkerId,
        reason: RetireReason,
    },
    /// An attempt to produce a worker failed.
    WorkerLaunchFailed { attempt: u32, error: String },
    LeaseAcquired { worker_id: WorkerId, lease_id: Uuid },
    LeaseReleased {
        worker_id: WorkerId,
        lease_id: Uuid,
        decision: RetireDecision,
    },
    /// The request deadline fired before release.
    LeaseTimedOut { worker_id: WorkerId, lease_id: Uuid },
    PoolClosing,
    PoolTerminated,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub leased_workers: usize,
    /// Callers waiting in `acquire`.
    pub waiting_acquirers: usize,
    pub leases_served: u64,
    pub launch_failures: u64,
    pub replenishments: u64,
    pub retirements: u64,
    pub timeouts: u64,
}

/// Monotonic counters behind [`PoolMetrics`].
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub leases_served: AtomicU64,
    pub launch_failures: AtomicU64,
    pub replenishments: AtomicU64,
    pub retirements: AtomicU64,
    pub timeouts: AtomicU64,
}

impl PoolCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, total: usize, idle: usize, leased: usize, waiting: usize) -> PoolMetrics {
        PoolMetrics {
            total_workers: total,
            idle_workers: idle,
            leased_workers: leased,
            waiting_acquirers: waiting,
            leases_served: self.leases_served.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
            replenishments: self.replenishments.load(Ordering::Relaxed),
            retirements: self.retirements.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
