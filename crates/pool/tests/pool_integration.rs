//! End-to-end pool tests against real `/bin/sh` workers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use engine::ProcessEngine;
use pool::{
    PoolConfig, PoolError, PoolEvent, PoolSettings, ProcessPool, RequestOutcome, RetireDecision,
    RetireReason,
};

fn settings(size: usize) -> PoolSettings {
    let mut settings = PoolSettings::default();
    settings.pool.size = size;
    settings.worker.command = vec!["/bin/sh".to_string()];
    settings
}

/// Workers that ignore stdin and only exit when signalled.
fn sleeper_settings(size: usize) -> PoolSettings {
    let mut settings = settings(size);
    settings.worker.command = vec!["sleep".to_string(), "30".to_string()];
    settings.shutdown.soft_timeout_ms = 200;
    settings.shutdown.grace_period_ms = 100;
    settings
}

async fn start(settings: PoolSettings) -> Arc<ProcessPool> {
    ProcessPool::start(ProcessEngine::new(), PoolConfig::new(settings))
        .await
        .unwrap()
}

fn pid_is_running(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state != "Z")
        })
        .unwrap_or(false)
}

async fn wait_until_dead(pid: u32) -> bool {
    for _ in 0..100 {
        if !pid_is_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// Leasing
// ============================================================================

#[tokio::test]
async fn test_single_worker_blocks_second_acquire() {
    let pool = start(settings(1)).await;

    let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let worker_id = first.worker_id();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    assert_eq!(
        first.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Keep
    );

    let second = waiter.await.unwrap().unwrap();
    assert_eq!(second.worker_id(), worker_id);
    assert_eq!(second.scope().reuse_count, 1);

    second.release(RequestOutcome::Success).unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn test_acquire_timeout() {
    let pool = start(settings(1)).await;
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let started = Instant::now();
    let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout(_)));
    assert!(err.is_transient());
    assert!(started.elapsed() >= Duration::from_millis(100));

    lease.release(RequestOutcome::Success).unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn test_unrepresentable_acquire_timeout_waits_without_deadline() {
    let pool = start(settings(1)).await;

    let first = pool.acquire(Duration::MAX).await.unwrap();
    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::MAX).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    first.release(RequestOutcome::Success).unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    second.release(RequestOutcome::Success).unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn test_full_acquire_queue_fails_fast() {
    let mut settings = settings(1);
    settings.pool.max_queue_depth = 1;
    let pool = start(settings).await;
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.metrics().waiting_acquirers, 1);

    let started = Instant::now();
    let err = pool.acquire(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, PoolError::QueueFull { waiting: 1, limit: 1 }));
    assert!(err.is_transient());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.metrics().waiting_acquirers, 1);

    lease.release(RequestOutcome::Success).unwrap();
    let next = waiter.await.unwrap().unwrap();
    assert_eq!(pool.metrics().waiting_acquirers, 0);

    next.release(RequestOutcome::Success).unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn test_session_round_trip_and_output_cleared() {
    let pool = start(settings(1)).await;

    let lease = pool.acquire_default().await.unwrap();
    let session = Arc::clone(lease.session().unwrap());
    session.write_line("echo first-request").await.unwrap();
    assert!(session
        .stdout()
        .wait_for("first-request", Duration::from_secs(5))
        .await
        .is_some());
    lease.release(RequestOutcome::Success).unwrap();

    let lease = pool.acquire_default().await.unwrap();
    assert_eq!(lease.session().unwrap().stdout().content(), "");
    lease.release(RequestOutcome::Success).unwrap();

    pool.shutdown().await;
}

#[tokio::test]
async fn test_double_release_and_use_after_release() {
    let pool = start(settings(1)).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    lease.release(RequestOutcome::Success).unwrap();

    let err = lease.release(RequestOutcome::Failure).unwrap_err();
    assert!(matches!(err, PoolError::AlreadyReleased(id) if id == lease.lease_id()));
    assert!(matches!(lease.session(), Err(PoolError::LeaseReleased(_))));

    // The failed second release must not have retired anything.
    assert_eq!(pool.metrics().retirements, 0);
    assert_eq!(pool.metrics().idle_workers, 1);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_worker_is_leased_twice() {
    let pool = start(settings(2)).await;
    let in_use = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        let in_use = Arc::clone(&in_use);
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let lease = pool.acquire(Duration::from_secs(10)).await.unwrap();
                assert!(
                    in_use.lock().unwrap().insert(lease.worker_id()),
                    "worker {} leased twice",
                    lease.worker_id()
                );
                tokio::task::yield_now().await;
                in_use.lock().unwrap().remove(&lease.worker_id());
                lease.release(RequestOutcome::Success).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(pool.metrics().leases_served, 160);
    assert_eq!(pool.metrics().total_workers, 2);
    pool.shutdown().await;
}

// ============================================================================
// Retirement
// ============================================================================

#[tokio::test]
async fn test_request_timeout_kills_and_replaces_worker() {
    let mut settings = settings(1);
    settings.pool.request_timeout_ms = 100;
    let pool = start(settings).await;
    let mut events = pool.subscribe();

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let pid = lease.session().unwrap().pid().unwrap();
    let worker_id = lease.worker_id();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(lease.is_expired());
    assert!(matches!(lease.session(), Err(PoolError::LeaseExpired(_))));
    assert_eq!(
        lease.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Retire(RetireReason::TimedOut)
    );
    assert!(wait_until_dead(pid).await);

    let replacement = pool.acquire(Duration::from_secs(5)).await.unwrap();
    assert_ne!(replacement.worker_id(), worker_id);
    replacement.release(RequestOutcome::Success).unwrap();

    let mut timed_out = false;
    while let Ok(event) = events.try_recv() {
        if event == (PoolEvent::LeaseTimedOut { worker_id, lease_id: lease.lease_id() }) {
            timed_out = true;
        }
    }
    assert!(timed_out);
    assert_eq!(pool.metrics().timeouts, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_request_timeout_ends_a_wait_on_a_stuck_worker() {
    let mut settings = sleeper_settings(1);
    settings.pool.request_timeout_ms = 200;
    let pool = start(settings).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let session = Arc::clone(lease.session().unwrap());

    let code = tokio::time::timeout(Duration::from_secs(3), session.wait())
        .await
        .expect("deadline did not stop the worker")
        .unwrap();
    assert_eq!(code, 128 + 9);
    assert!(lease.is_expired());
    assert!(!session.is_alive());
    assert_eq!(
        lease.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Retire(RetireReason::TimedOut)
    );
    assert_eq!(pool.metrics().timeouts, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_release_before_deadline_keeps_worker() {
    let mut settings = settings(1);
    settings.pool.request_timeout_ms = 200;
    let pool = start(settings).await;

    for _ in 0..5 {
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            lease.release(RequestOutcome::Success).unwrap(),
            RetireDecision::Keep
        );
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(pool.metrics().timeouts, 0);
    assert_eq!(pool.metrics().retirements, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_max_uses_retires_worker() {
    let mut settings = settings(1);
    settings.pool.max_uses = 2;
    let pool = start(settings).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let first_worker = lease.worker_id();
    assert_eq!(
        lease.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Keep
    );

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(lease.worker_id(), first_worker);
    assert_eq!(
        lease.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Retire(RetireReason::MaxUsesExceeded)
    );

    let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
    assert_ne!(lease.worker_id(), first_worker);
    lease.release(RequestOutcome::Success).unwrap();

    pool.shutdown().await;
}

#[tokio::test]
async fn test_crashed_worker_is_retired() {
    let pool = start(settings(1)).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let session = Arc::clone(lease.session().unwrap());
    session.write_line("exit 0").await.unwrap();
    for _ in 0..100 {
        if !session.is_alive() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        lease.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Retire(RetireReason::Crashed)
    );
    pool.shutdown().await;
}

#[tokio::test]
async fn test_retirement_policy_hook() {
    let config = PoolConfig::new(settings(1)).with_retirement_policy(|_scope, outcome| {
        if outcome == RequestOutcome::Failure {
            RetireDecision::Retire(RetireReason::Explicit)
        } else {
            RetireDecision::Keep
        }
    });
    let pool = ProcessPool::start(ProcessEngine::new(), config).await.unwrap();

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        lease.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Keep
    );

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        lease.release(RequestOutcome::Failure).unwrap(),
        RetireDecision::Retire(RetireReason::Explicit)
    );

    pool.shutdown().await;
}

// ============================================================================
// Warmup
// ============================================================================

#[tokio::test]
async fn test_warmup_failure_is_retried_transparently() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = PoolConfig::new(settings(1)).with_warmup({
        let calls = Arc::clone(&calls);
        move |session| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("first worker is rejected");
                }
                session.write_line("echo warmed").await?;
                session
                    .stdout()
                    .wait_for("warmed", Duration::from_secs(5))
                    .await
                    .ok_or_else(|| anyhow::anyhow!("no warmup banner"))?;
                Ok::<(), anyhow::Error>(())
            }
        }
    });

    let pool = ProcessPool::start(ProcessEngine::new(), config).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(pool.metrics().launch_failures, 1);

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(lease.worker_id(), 2);
    // Warmup output is not visible to callers.
    assert_eq!(lease.session().unwrap().stdout().content(), "");
    lease.release(RequestOutcome::Success).unwrap();

    pool.shutdown().await;
}

#[tokio::test]
async fn test_warmup_that_never_succeeds_fails_start() {
    let mut settings = settings(1);
    settings.pool.launch_retries = 2;
    let config = PoolConfig::new(settings)
        .with_warmup(|_session| async { Err::<(), _>(anyhow::anyhow!("broken runtime")) });

    let err = ProcessPool::start(ProcessEngine::new(), config)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::WarmupFailed { .. }));
}

#[tokio::test]
async fn test_idle_workers_are_reaped_and_replaced() {
    let mut settings = settings(1);
    settings.pool.max_idle_time_ms = 100;
    let pool = start(settings).await;
    let mut events = pool.subscribe();

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let first = lease.worker_id();
    let pid = lease.session().unwrap().pid().unwrap();
    lease.release(RequestOutcome::Success).unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut reaped = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (PoolEvent::WorkerRetired {
                worker_id: first,
                reason: RetireReason::Explicit,
            })
        {
            reaped = true;
        }
    }
    assert!(reaped);
    assert!(wait_until_dead(pid).await);

    let replacement = pool.acquire(Duration::from_secs(5)).await.unwrap();
    assert_ne!(replacement.worker_id(), first);
    replacement.release(RequestOutcome::Success).unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn test_worker_lifetime_limit() {
    let mut settings = settings(1);
    settings.pool.max_worker_lifetime_ms = 150;
    let pool = start(settings).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let first = lease.worker_id();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        lease.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Retire(RetireReason::Explicit)
    );

    let replacement = pool.acquire(Duration::from_secs(5)).await.unwrap();
    assert_ne!(replacement.worker_id(), first);
    replacement.release(RequestOutcome::Success).unwrap();
    pool.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_while_caller_waits_on_session() {
    let mut settings = sleeper_settings(1);
    settings.pool.request_timeout_ms = 0;
    let pool = start(settings).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let session = Arc::clone(lease.session().unwrap());
    let waiter = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(3), pool.shutdown())
        .await
        .expect("shutdown blocked by a caller waiting on its worker");

    let code = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(code, 128 + 9);
    assert_eq!(pool.metrics().total_workers, 0);
    drop(lease);
}

#[tokio::test]
async fn test_drain_waits_for_outstanding_leases() {
    let pool = start(settings(2)).await;
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        lease.release(RequestOutcome::Success).unwrap();
    });

    let started = Instant::now();
    assert!(pool.drain(Duration::from_secs(5)).await);
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(pool.is_closed());
    assert_eq!(pool.metrics().total_workers, 0);

    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, PoolError::Closed));
}

#[tokio::test]
async fn test_drain_timeout_leaves_leases_usable() {
    let pool = start(settings(1)).await;
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();

    assert!(!pool.drain(Duration::from_millis(100)).await);
    assert!(pool.is_closed());
    assert!(matches!(
        pool.acquire(Duration::from_millis(50)).await,
        Err(PoolError::Closed)
    ));

    let session = lease.session().unwrap();
    session.write_line("echo still-here").await.unwrap();
    assert!(session
        .stdout()
        .wait_for("still-here", Duration::from_secs(2))
        .await
        .is_some());

    assert_eq!(
        lease.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Retire(RetireReason::Explicit)
    );
    assert!(pool.drain(Duration::ZERO).await);
    assert_eq!(pool.metrics().total_workers, 0);
}

#[tokio::test]
async fn test_shutdown_kills_leased_and_closes_idle() {
    let pool = start(settings(2)).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let session = lease.session().unwrap();
    let leased_pid = session.pid().unwrap();
    // Busy: stdin EOF alone would not stop it.
    session.write_line("sleep 30").await.unwrap();

    let started = Instant::now();
    pool.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(wait_until_dead(leased_pid).await);

    assert!(pool.is_closed());
    assert_eq!(pool.metrics().total_workers, 0);
    assert!(pool.active_leases().is_empty());
    assert_eq!(
        lease.release(RequestOutcome::Success).unwrap(),
        RetireDecision::Retire(RetireReason::Explicit)
    );

    // Idempotent.
    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_wakes_waiters() {
    let pool = start(settings(1)).await;
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
    drop(lease);
}

#[tokio::test]
async fn test_shutdown_events() {
    let pool = start(settings(1)).await;
    let mut events = pool.subscribe();

    pool.shutdown().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.first(), Some(&PoolEvent::PoolClosing));
    assert_eq!(seen.last(), Some(&PoolEvent::PoolTerminated));
    assert!(seen.iter().any(|event| matches!(
        event,
        PoolEvent::WorkerRetired {
            reason: RetireReason::Explicit,
            ..
        }
    )));
}
