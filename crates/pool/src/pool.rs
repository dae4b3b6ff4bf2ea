//! The process pool.
//!
//! Idle workers sit in a FIFO queue guarded by a fair semaphore whose permit
//! count equals the queue length. A worker returns to the queue only after
//! its registry entry is removed and its state is `Idle`, so release and a
//! following acquire are linearizable. Idle workers past their idle or
//! lifetime limit are retired by a reaper task and skipped by `acquire`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use engine::{ProcessEngine, SessionSpec};
use futures_util::future::join_all;
use tokio::sync::{broadcast, Notify, Semaphore, TryAcquireError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{PoolConfig, PoolSettings};
use crate::error::PoolError;
use crate::events::{PoolCounters, PoolEvent, PoolMetrics, EVENT_CHANNEL_CAPACITY};
use crate::lease::{ActiveLeaseRegistry, LeaseScope, LeaseStatus, WorkerLease};
use crate::retire::{decide, RequestOutcome, RetireContext, RetireDecision, RetireReason};
use crate::timeout::RequestTimeoutScheduler;
use crate::worker::{Worker, WorkerId, WorkerState};

/// Base delay between launch attempts, multiplied by the attempt number.
const LAUNCH_BACKOFF_STEP: Duration = Duration::from_millis(50);

const LAUNCH_BACKOFF_MAX: Duration = Duration::from_millis(500);

const REAP_INTERVAL_MIN: Duration = Duration::from_millis(10);

const REAP_INTERVAL_MAX: Duration = Duration::from_secs(1);

fn launch_backoff(attempt: u32) -> Duration {
    LAUNCH_BACKOFF_STEP
        .saturating_mul(attempt)
        .min(LAUNCH_BACKOFF_MAX)
}

/// A fixed-size pool of interactive worker processes.
pub struct ProcessPool {
    engine: ProcessEngine,
    config: PoolConfig,
    spec: SessionSpec,
    /// Every live worker. Removing a worker from this map claims its teardown.
    workers: DashMap<WorkerId, Arc<Worker>>,
    idle: Mutex<VecDeque<Arc<Worker>>>,
    idle_permits: Semaphore,
    /// Callers parked in `acquire`.
    waiting: AtomicUsize,
    leases: ActiveLeaseRegistry,
    leases_changed: Notify,
    timeouts: RequestTimeoutScheduler,
    next_worker_id: AtomicU32,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
    terminated: AtomicBool,
    shutdown_lock: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<PoolEvent>,
    counters: PoolCounters,
}

impl ProcessPool {
    /// Validates `config` and launches the initial workers.
    ///
    /// Fails if any worker cannot be produced within the configured number
    /// of launch attempts; workers already started are shut down.
    pub async fn start(engine: ProcessEngine, config: PoolConfig) -> Result<Arc<Self>, PoolError> {
        config.settings().validate()?;
        let spec = config.session_spec()?;
        let size = config.settings().pool.size;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let pool = Arc::new(Self {
            engine,
            config,
            spec,
            workers: DashMap::new(),
            idle: Mutex::new(VecDeque::with_capacity(size)),
            idle_permits: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
            leases: ActiveLeaseRegistry::new(),
            leases_changed: Notify::new(),
            timeouts: RequestTimeoutScheduler::new(),
            next_worker_id: AtomicU32::new(1),
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            shutdown_lock: tokio::sync::Mutex::new(()),
            event_tx,
            counters: PoolCounters::default(),
        });

        info!(
            size,
            command = ?pool.spec.command,
            pty = pool.spec.pty.is_some(),
            "Starting process pool"
        );

        let launches = join_all((0..size).map(|_| pool.launch_worker())).await;
        let mut failure = None;
        for result in launches {
            match result {
                Ok(worker) => {
                    pool.admit(worker);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            error!(error = %e, "Process pool failed to start");
            pool.shutdown().await;
            return Err(e);
        }

        pool.start_reaper();
        Ok(pool)
    }

    /// Waits up to `timeout` for an idle worker.
    ///
    /// Waiters are served in arrival order. A timeout too large to represent
    /// waits without a deadline. Fails with [`PoolError::QueueFull`] when
    /// the configured number of callers is already waiting, and with
    /// [`PoolError::Closed`] once the pool is closing.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<WorkerLease, PoolError> {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            if self.is_closed() {
                return Err(PoolError::Closed);
            }
            let permit = match self.idle_permits.try_acquire() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
                Err(TryAcquireError::NoPermits) => {
                    let _slot = self.join_queue()?;
                    let acquired = match deadline {
                        Some(deadline) => {
                            tokio::time::timeout_at(deadline, self.idle_permits.acquire())
                                .await
                                .map_err(|_| PoolError::AcquireTimeout(timeout))?
                        }
                        None => self.idle_permits.acquire().await,
                    };
                    acquired.map_err(|_| PoolError::Closed)?
                }
            };
            permit.forget();

            let next = self.lock_idle().pop_front();
            let Some(worker) = next else {
                continue;
            };

            if !worker.is_alive() {
                warn!(worker_id = worker.id(), "Idle worker died, replacing it");
                self.retire_worker(worker, RetireReason::Crashed);
                continue;
            }
            if let Some(limit) = self.outstayed(&worker) {
                debug!(worker_id = worker.id(), limit, "Skipping worker past its limit");
                self.retire_worker(worker, RetireReason::Explicit);
                continue;
            }

            let scope = LeaseScope::open(&worker);
            if !self.leases.register(&worker, scope.clone()) {
                debug!(worker_id = worker.id(), "Skipping worker that cannot be leased");
                continue;
            }
            if self.is_closed() {
                self.leases
                    .release(&worker, scope.lease_id, WorkerState::Retired);
                return Err(PoolError::Closed);
            }

            let status = Arc::new(LeaseStatus::default());
            let armed = match self.settings().request_timeout() {
                Some(after) => self.timeouts.schedule(
                    scope.lease_id,
                    after,
                    expire(
                        Arc::downgrade(self),
                        Arc::clone(&worker),
                        scope.clone(),
                        Arc::clone(&status),
                    ),
                ),
                None => false,
            };

            debug!(
                worker_id = worker.id(),
                lease_id = %scope.lease_id,
                reuse_count = scope.reuse_count,
                "Lease acquired"
            );
            self.emit(PoolEvent::LeaseAcquired {
                worker_id: worker.id(),
                lease_id: scope.lease_id,
            });

            return Ok(WorkerLease::new(
                Arc::clone(self),
                worker,
                scope,
                status,
                armed,
            ));
        }
    }

    /// Counts the caller as waiting, or rejects it when the queue is full.
    fn join_queue(&self) -> Result<QueueSlot<'_>, PoolError> {
        let waiting = self.waiting.fetch_add(1, Ordering::AcqRel);
        let slot = QueueSlot(&self.waiting);
        match self.settings().max_queue_depth() {
            Some(limit) if waiting >= limit => {
                debug!(waiting, limit, "Acquire queue full");
                Err(PoolError::QueueFull { waiting, limit })
            }
            _ => Ok(slot),
        }
    }

    /// [`acquire`](Self::acquire) with the configured acquire timeout.
    pub async fn acquire_default(self: &Arc<Self>) -> Result<WorkerLease, PoolError> {
        self.acquire(self.settings().acquire_timeout()).await
    }

    /// Finishes a lease and decides the worker's fate.
    pub(crate) fn complete_lease(
        self: &Arc<Self>,
        worker: &Arc<Worker>,
        scope: &LeaseScope,
        status: &LeaseStatus,
        outcome: RequestOutcome,
        deadline_armed: bool,
    ) -> RetireDecision {
        // An expired lease or a closing pool already owns the worker's teardown.
        let decision = if status.is_expired() {
            RetireDecision::Retire(RetireReason::TimedOut)
        } else if self.is_closed() {
            if deadline_armed {
                self.timeouts.cancel(&scope.lease_id);
            }
            RetireDecision::Retire(RetireReason::Explicit)
        } else if deadline_armed && !self.timeouts.cancel(&scope.lease_id) {
            // Lost the race with the deadline.
            RetireDecision::Retire(RetireReason::TimedOut)
        } else {
            let uses = worker.record_use();
            PoolCounters::incr(&self.counters.leases_served);
            let ctx = RetireContext {
                alive: worker.is_alive(),
                uses,
                max_uses: self.settings().max_uses(),
                age: worker.age(),
                max_lifetime: self.settings().max_worker_lifetime(),
            };
            let policy = self.config.retirement_policy().map(|policy| policy.as_ref());
            let decision = decide(scope, outcome, ctx, policy);

            if let RetireDecision::Retire(reason) = decision {
                self.leases
                    .release(worker, scope.lease_id, WorkerState::Retired);
                self.retire_worker(Arc::clone(worker), reason);
            } else {
                worker.session().clear_output();
                if self
                    .leases
                    .release(worker, scope.lease_id, WorkerState::Idle)
                    .is_some()
                {
                    worker.mark_idle();
                    self.lock_idle().push_back(Arc::clone(worker));
                    self.idle_permits.add_permits(1);
                }
            }
            decision
        };

        if !decision.is_keep() {
            self.leases
                .release(worker, scope.lease_id, WorkerState::Retired);
        }

        debug!(
            worker_id = worker.id(),
            lease_id = %scope.lease_id,
            ?outcome,
            ?decision,
            held_ms = scope.elapsed().as_millis() as u64,
            "Lease released"
        );
        self.emit(PoolEvent::LeaseReleased {
            worker_id: worker.id(),
            lease_id: scope.lease_id,
            decision,
        });
        self.leases_changed.notify_waiters();
        decision
    }

    /// Handles a fired request deadline.
    async fn expire_lease(self: Arc<Self>, worker: Arc<Worker>, scope: LeaseScope) {
        warn!(
            worker_id = worker.id(),
            lease_id = %scope.lease_id,
            held_ms = scope.elapsed().as_millis() as u64,
            "Request timed out, killing worker"
        );
        PoolCounters::incr(&self.counters.timeouts);
        self.emit(PoolEvent::LeaseTimedOut {
            worker_id: worker.id(),
            lease_id: scope.lease_id,
        });
        self.leases
            .release(&worker, scope.lease_id, WorkerState::Retired);
        self.leases_changed.notify_waiters();
        self.retire_worker(worker, RetireReason::TimedOut);
    }

    /// Tears `worker` down in the background and schedules a replacement.
    fn retire_worker(self: &Arc<Self>, worker: Arc<Worker>, reason: RetireReason) {
        worker.retire();
        if self.workers.remove(&worker.id()).is_none() {
            // Shutdown already owns it.
            return;
        }

        PoolCounters::incr(&self.counters.retirements);
        info!(
            worker_id = worker.id(),
            pid = ?worker.session().pid(),
            uses = worker.uses(),
            %reason,
            "Worker retired"
        );
        self.emit(PoolEvent::WorkerRetired {
            worker_id: worker.id(),
            reason,
        });

        let pool = Arc::clone(self);
        self.spawn(async move {
            let result = if reason == RetireReason::TimedOut {
                worker.session().kill().await
            } else {
                worker.session().close().await
            };
            if let Err(e) = result {
                warn!(worker_id = worker.id(), error = %e, "Worker teardown failed");
            }
            pool.replenish().await;
        });
    }

    async fn replenish(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        match self.launch_worker().await {
            Ok(worker) => {
                if self.admit(worker) {
                    PoolCounters::incr(&self.counters.replenishments);
                }
            }
            Err(PoolError::Closed) => {}
            Err(e) => {
                error!(error = %e, "Failed to replace retired worker, pool is below capacity");
            }
        }
    }

    /// Produces a warmed worker, retrying with backoff.
    async fn launch_worker(self: &Arc<Self>) -> Result<Arc<Worker>, PoolError> {
        let attempts = self.settings().pool.launch_retries.max(1);
        let mut attempt = 1;
        loop {
            if self.is_closed() {
                return Err(PoolError::Closed);
            }
            match self.launch_once().await {
                Ok(worker) => return Ok(worker),
                Err(PoolError::Closed) => return Err(PoolError::Closed),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Worker launch failed");
                    PoolCounters::incr(&self.counters.launch_failures);
                    self.emit(PoolEvent::WorkerLaunchFailed {
                        attempt,
                        error: e.to_string(),
                    });
                    if attempt >= attempts {
                        return Err(e);
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown_token.cancelled() => return Err(PoolError::Closed),
                _ = tokio::time::sleep(launch_backoff(attempt)) => {}
            }
            attempt += 1;
        }
    }

    async fn launch_once(&self) -> Result<Arc<Worker>, PoolError> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let session = self.engine.start_session(&self.spec).map_err(PoolError::Launch)?;
        let worker = Arc::new(Worker::new(id, session));

        if let Some(warmup) = self.config.warmup() {
            worker.transition(WorkerState::Warming);
            let result = tokio::select! {
                _ = self.shutdown_token.cancelled() => None,
                result = warmup(Arc::clone(worker.session())) => Some(result),
            };
            match result {
                Some(Ok(())) => worker.session().clear_output(),
                Some(Err(source)) => {
                    worker.retire();
                    PoolCounters::incr(&self.counters.retirements);
                    warn!(worker_id = id, error = %source, "Worker warmup failed");
                    self.emit(PoolEvent::WorkerRetired {
                        worker_id: id,
                        reason: RetireReason::WarmupFailed,
                    });
                    if let Err(e) = worker.session().kill().await {
                        debug!(worker_id = id, error = %e, "Failed to kill rejected worker");
                    }
                    return Err(PoolError::WarmupFailed {
                        worker_id: id,
                        source,
                    });
                }
                None => {
                    worker.retire();
                    if let Err(e) = worker.session().kill().await {
                        debug!(worker_id = id, error = %e, "Failed to kill warming worker");
                    }
                    return Err(PoolError::Closed);
                }
            }
        }

        worker.transition(WorkerState::Idle);
        Ok(worker)
    }

    /// Publishes a warmed worker. Returns false if the pool closed meanwhile.
    fn admit(self: &Arc<Self>, worker: Arc<Worker>) -> bool {
        let id = worker.id();
        self.workers.insert(id, Arc::clone(&worker));

        // Shutdown may have taken its snapshot before the insert.
        if self.is_closed() {
            if self.workers.remove(&id).is_some() {
                worker.retire();
                self.spawn(async move {
                    if let Err(e) = worker.session().kill().await {
                        debug!(worker_id = id, error = %e, "Failed to kill late worker");
                    }
                });
            }
            return false;
        }

        worker.mark_idle();
        self.lock_idle().push_back(Arc::clone(&worker));
        self.idle_permits.add_permits(1);

        info!(worker_id = id, pid = ?worker.session().pid(), "Worker ready");
        self.emit(PoolEvent::WorkerCreated {
            worker_id: id,
            pid: worker.session().pid(),
        });
        true
    }

    /// Why an idle worker must not be leased again, if it has outstayed a
    /// configured limit.
    fn outstayed(&self, worker: &Worker) -> Option<&'static str> {
        let settings = self.settings();
        if matches!(settings.max_worker_lifetime(), Some(max) if worker.age() >= max) {
            return Some("lifetime");
        }
        if matches!(settings.max_idle_time(), Some(max) if worker.idle_for() >= max) {
            return Some("idle");
        }
        None
    }

    /// Runs [`reap_idle`](Self::reap_idle) periodically until shutdown, when
    /// an idle or lifetime limit is configured.
    fn start_reaper(self: &Arc<Self>) {
        let limits = [
            self.settings().max_idle_time(),
            self.settings().max_worker_lifetime(),
        ];
        let Some(shortest) = limits.into_iter().flatten().min() else {
            return;
        };
        let period = (shortest / 4).clamp(REAP_INTERVAL_MIN, REAP_INTERVAL_MAX);
        let pool = Arc::downgrade(self);
        let token = self.shutdown_token.clone();

        debug!(period_ms = period.as_millis() as u64, "Starting idle reaper");
        self.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.reap_idle();
            }
        });
    }

    /// Retires idle workers that have outstayed their limits.
    ///
    /// Each reaped worker gives up one idle permit. When every permit is
    /// already claimed by an acquirer the worker stays queued; that acquirer
    /// will skip it.
    fn reap_idle(self: &Arc<Self>) {
        let mut reaped = Vec::new();
        self.lock_idle().retain(|worker| {
            let Some(limit) = self.outstayed(worker) else {
                return true;
            };
            match self.idle_permits.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    reaped.push((Arc::clone(worker), limit));
                    false
                }
                Err(_) => true,
            }
        });

        for (worker, limit) in reaped {
            info!(
                worker_id = worker.id(),
                limit,
                idle_ms = worker.idle_for().as_millis() as u64,
                age_ms = worker.age().as_millis() as u64,
                "Reaping idle worker"
            );
            self.retire_worker(worker, RetireReason::Explicit);
        }
    }

    /// Refuses new acquisitions. Returns false if already closing.
    fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(workers = self.workers.len(), leased = self.leases.len(), "Process pool closing");
        self.emit(PoolEvent::PoolClosing);
        self.idle_permits.close();
        true
    }

    /// Stops new acquisitions and waits up to `timeout` for every lease to
    /// come back, then shuts the pool down.
    ///
    /// Returns false if leases were still out when `timeout` elapsed. The
    /// pool then stays closing: those leases remain usable until released
    /// or expired, and a later `drain` or [`shutdown`](Self::shutdown)
    /// finishes the job. A zero timeout only checks; one too large to
    /// represent waits without a deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.begin_close();
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            let changed = self.leases_changed.notified();
            tokio::pin!(changed);
            // Register before checking so a release in between is not missed.
            changed.as_mut().enable();

            if self.leases.is_empty() {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, changed).await.is_err() {
                        warn!(leased = self.leases.len(), "Drain timed out with leases outstanding");
                        return false;
                    }
                }
                None => changed.await,
            }
        }

        self.shutdown().await;
        true
    }

    /// Retires every worker and waits for them to exit.
    ///
    /// Idle workers go through the graceful shutdown escalation; leased ones
    /// are killed. Idempotent; later operations fail with
    /// [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock().await;
        if self.terminated.load(Ordering::Acquire) {
            return;
        }

        self.begin_close();
        info!(workers = self.workers.len(), leased = self.leases.len(), "Shutting down process pool");

        self.shutdown_token.cancel();
        self.timeouts.close();
        // An expiry already running hands its worker to the tracker.
        self.timeouts.wait().await;
        self.tracker.close();
        self.tracker.wait().await;

        let snapshot: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut teardown = Vec::with_capacity(snapshot.len());
        for worker in snapshot {
            if self.workers.remove(&worker.id()).is_none() {
                continue;
            }
            let leased = worker.state() == WorkerState::Leased;
            worker.retire();
            PoolCounters::incr(&self.counters.retirements);
            self.emit(PoolEvent::WorkerRetired {
                worker_id: worker.id(),
                reason: RetireReason::Explicit,
            });

            teardown.push(async move {
                let result = if leased {
                    worker.session().kill().await
                } else {
                    worker.session().close().await
                };
                if let Err(e) = result {
                    warn!(worker_id = worker.id(), error = %e, "Worker teardown failed");
                }
            });
        }
        join_all(teardown).await;

        self.lock_idle().clear();
        self.leases.clear();
        self.leases_changed.notify_waiters();
        self.terminated.store(true, Ordering::Release);

        info!("Process pool terminated");
        self.emit(PoolEvent::PoolTerminated);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &PoolSettings {
        self.config.settings()
    }

    /// Returns a receiver for pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.event_tx.subscribe()
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.counters.snapshot(
            self.workers.len(),
            self.lock_idle().len(),
            self.leases.len(),
            self.waiting.load(Ordering::Acquire),
        )
    }

    /// Weakly consistent snapshot of the active leases.
    pub fn active_leases(&self) -> Vec<LeaseScope> {
        self.leases.snapshot()
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if tokio::runtime::Handle::try_current().is_err() {
            // Outside a runtime the sessions are killed when dropped.
            warn!("No runtime available for worker teardown");
            return;
        }
        self.tracker.spawn(task);
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<Arc<Worker>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A caller's place in the acquire queue; leaves it on drop.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Deadline callback for one lease.
async fn expire(
    pool: Weak<ProcessPool>,
    worker: Arc<Worker>,
    scope: LeaseScope,
    status: Arc<LeaseStatus>,
) {
    status.mark_expired();
    match pool.upgrade() {
        Some(pool) => pool.expire_lease(worker, scope).await,
        None => {
            if let Err(e) = worker.session().kill().await {
                debug!(worker_id = worker.id(), error = %e, "Failed to kill expired worker");
            }
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        self.timeouts.close();
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("workers", &self.workers.len())
            .field("leases", &self.leases.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
