//! # ProcPool
//!
//! A pool of long-lived interactive subprocesses (shells, REPLs, language
//! runtimes) that are expensive to start and cheap to reuse.
//!
//! ## Overview
//!
//! - **Leases**: each worker is lent to exactly one caller at a time
//! - **Request deadlines**: a lease that outlives its timeout is killed and
//!   its worker retired, without touching other workers
//! - **Retirement**: after every request the pool decides whether the worker
//!   stays; retired workers are replaced in the background
//! - **Warmup**: new workers can be prepared before they are first leased
//! - **Limits**: optional caps on waiting callers, idle time and worker age
//! - **Drain**: stop admitting callers and wait for outstanding leases
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        ProcessPool                        │
//! │   acquire ──► idle queue + fair semaphore ──► WorkerLease │
//! ├──────────────────────┬──────────────────┬─────────────────┤
//! │ ActiveLeaseRegistry  │ RequestTimeout   │ retire::decide  │
//! │ (DashMap by worker)  │ Scheduler        │ + policy hook   │
//! ├──────────────────────┴──────────────────┴─────────────────┤
//! │          engine::ProcessEngine / InteractiveSession       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use engine::ProcessEngine;
//! use pool::{PoolConfig, PoolSettings, ProcessPool, RequestOutcome};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut settings = PoolSettings::load_or_default(pool::default_config_path())?;
//!     settings.apply_env_overrides();
//!     pool::logging::init(&settings.logging.level);
//!
//!     let pool = ProcessPool::start(ProcessEngine::new(), PoolConfig::new(settings)).await?;
//!
//!     let lease = pool.acquire(Duration::from_secs(5)).await?;
//!     let session = lease.session()?;
//!     session.write_line("echo ready").await?;
//!     session.stdout().wait_for("ready", Duration::from_secs(1)).await;
//!     lease.release(RequestOutcome::Success)?;
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod lease;
pub mod logging;
pub mod pool;
pub mod retire;
pub mod timeout;
pub mod worker;

pub use config::{
    default_config_path, ConfigError, PoolConfig, PoolSettings, RetirementPolicy, WarmupAction,
};
pub use error::PoolError;
pub use events::{PoolEvent, PoolMetrics};
pub use lease::{ActiveLeaseRegistry, LeaseScope, WorkerLease};
pub use pool::ProcessPool;
pub use retire::{RequestOutcome, RetireDecision, RetireReason};
pub use timeout::RequestTimeoutScheduler;
pub use worker::{Worker, WorkerId, WorkerState};
