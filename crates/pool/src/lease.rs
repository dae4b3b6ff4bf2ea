//! Leases: which worker is checked out to which caller.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use engine::InteractiveSession;
use uuid::Uuid;

use crate::error::PoolError;
use crate::pool::ProcessPool;
use crate::retire::{RequestOutcome, RetireDecision};
use crate::worker::{Worker, WorkerId, WorkerState};

/// Immutable snapshot of an active lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseScope {
    pub lease_id: Uuid,
    pub worker_id: WorkerId,
    pub started_at: Instant,
    /// Completed uses of the worker when the lease started.
    pub reuse_count: u64,
    pub worker_created_at: Instant,
}

impl LeaseScope {
    pub(crate) fn open(worker: &Worker) -> Self {
        Self {
            lease_id: Uuid::new_v4(),
            worker_id: worker.id(),
            started_at: Instant::now(),
            reuse_count: worker.uses(),
            worker_created_at: worker.created_at(),
        }
    }

    /// Time since the lease was acquired.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Active leases keyed by worker.
///
/// A worker's state changes together with its registry entry, under that
/// entry's shard lock. Iteration is weakly consistent.
#[derive(Debug, Default)]
pub struct ActiveLeaseRegistry {
    leases: DashMap<WorkerId, LeaseScope>,
}

impl ActiveLeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `worker` leased and records `scope`.
    ///
    /// Fails if the worker already has a lease or has been retired.
    pub(crate) fn register(&self, worker: &Worker, scope: LeaseScope) -> bool {
        match self.leases.entry(worker.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                if worker.transition(WorkerState::Leased) == WorkerState::Retired {
                    return false;
                }
                entry.insert(scope);
                true
            }
        }
    }

    /// Removes the lease `lease_id` of `worker`, moving the worker to `next`.
    ///
    /// Returns `None` if that lease is no longer registered.
    pub(crate) fn release(
        &self,
        worker: &Worker,
        lease_id: Uuid,
        next: WorkerState,
    ) -> Option<LeaseScope> {
        match self.leases.entry(worker.id()) {
            Entry::Occupied(entry) if entry.get().lease_id == lease_id => {
                worker.transition(next);
                Some(entry.remove())
            }
            _ => None,
        }
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<LeaseScope> {
        self.leases.get(&worker_id).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<LeaseScope> {
        self.leases.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub(crate) fn clear(&self) {
        self.leases.clear();
    }
}

/// Release bookkeeping shared between a lease and its deadline timer.
#[derive(Debug, Default)]
pub(crate) struct LeaseStatus {
    released: AtomicBool,
    expired: AtomicBool,
}

impl LeaseStatus {
    /// Claims the single release. False if already claimed.
    pub fn claim_release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn mark_expired(&self) {
        self.expired.store(true, Ordering::Release);
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

/// Exclusive access to one worker for one request.
///
/// Call [`release`](Self::release) exactly once. A lease dropped without
/// release is released as [`RequestOutcome::Abandoned`], which retires the
/// worker.
pub struct WorkerLease {
    pool: Arc<ProcessPool>,
    worker: Arc<Worker>,
    scope: LeaseScope,
    status: Arc<LeaseStatus>,
    deadline_armed: bool,
}

impl WorkerLease {
    pub(crate) fn new(
        pool: Arc<ProcessPool>,
        worker: Arc<Worker>,
        scope: LeaseScope,
        status: Arc<LeaseStatus>,
        deadline_armed: bool,
    ) -> Self {
        Self {
            pool,
            worker,
            scope,
            status,
            deadline_armed,
        }
    }

    pub fn lease_id(&self) -> Uuid {
        self.scope.lease_id
    }

    pub fn worker_id(&self) -> WorkerId {
        self.scope.worker_id
    }

    pub fn scope(&self) -> &LeaseScope {
        &self.scope
    }

    /// The leased session.
    pub fn session(&self) -> Result<&Arc<InteractiveSession>, PoolError> {
        if self.status.is_expired() {
            return Err(PoolError::LeaseExpired(self.scope.lease_id));
        }
        if self.status.is_released() {
            return Err(PoolError::LeaseReleased(self.scope.lease_id));
        }
        Ok(self.worker.session())
    }

    pub fn is_released(&self) -> bool {
        self.status.is_released()
    }

    /// Whether the request deadline fired.
    pub fn is_expired(&self) -> bool {
        self.status.is_expired()
    }

    /// Returns the worker to the pool and reports what happened to it.
    pub fn release(&self, outcome: RequestOutcome) -> Result<RetireDecision, PoolError> {
        if !self.status.claim_release() {
            return Err(PoolError::AlreadyReleased(self.scope.lease_id));
        }
        Ok(self.pool.complete_lease(
            &self.worker,
            &self.scope,
            &self.status,
            outcome,
            self.deadline_armed,
        ))
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.status.claim_release() {
            tracing::debug!(
                lease_id = %self.scope.lease_id,
                worker_id = self.scope.worker_id,
                "Lease dropped without release"
            );
            self.pool.complete_lease(
                &self.worker,
                &self.scope,
                &self.status,
                RequestOutcome::Abandoned,
                self.deadline_armed,
            );
        }
    }
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLease")
            .field("scope", &self.scope)
            .field("released", &self.status.is_released())
            .field("expired", &self.status.is_expired())
            .finish()
    }
}
