//! Pool error types.

use std::time::Duration;

use engine::EngineError;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::worker::WorkerId;

/// Errors returned by [`ProcessPool`](crate::ProcessPool) and
/// [`WorkerLease`](crate::WorkerLease).
#[derive(Debug, Error)]
pub enum PoolError {
    /// No worker became idle in time. The caller may retry.
    #[error("no idle worker within {0:?}")]
    AcquireTimeout(Duration),

    /// Too many callers are already waiting. The caller may retry.
    #[error("acquire queue is full ({waiting} waiting, limit {limit})")]
    QueueFull { waiting: usize, limit: usize },

    #[error("pool is shut down")]
    Closed,

    #[error("lease {0} was already released")]
    AlreadyReleased(Uuid),

    #[error("lease {0} has been released")]
    LeaseReleased(Uuid),

    /// The request deadline fired and the worker was killed.
    #[error("lease {0} expired")]
    LeaseExpired(Uuid),

    #[error("failed to launch worker: {0}")]
    Launch(#[source] EngineError),

    /// A new worker was rejected before it was ever leased.
    #[error("warmup of worker {worker_id} failed: {source}")]
    WarmupFailed {
        worker_id: WorkerId,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PoolError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PoolError::AcquireTimeout(_) | PoolError::QueueFull { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        assert_eq!(
            PoolError::AcquireTimeout(Duration::from_millis(250)).to_string(),
            "no idle worker within 250ms"
        );
        assert_eq!(PoolError::Closed.to_string(), "pool is shut down");
        assert!(PoolError::AlreadyReleased(id)
            .to_string()
            .contains("already released"));
        assert!(PoolError::LeaseExpired(id).to_string().contains("expired"));
    }

    #[test]
    fn test_error_sources() {
        let err = PoolError::Launch(EngineError::EmptyCommand);
        assert!(err.source().is_some());

        let err = PoolError::WarmupFailed {
            worker_id: 3,
            source: anyhow::anyhow!("banner missing"),
        };
        assert_eq!(
            err.to_string(),
            "warmup of worker 3 failed: banner missing"
        );

        let err: PoolError = ConfigError::EmptyCommand.into();
        assert_eq!(err.to_string(), "worker command must not be empty");
    }

    #[test]
    fn test_transient_errors() {
        assert!(PoolError::AcquireTimeout(Duration::ZERO).is_transient());
        let full = PoolError::QueueFull {
            waiting: 4,
            limit: 4,
        };
        assert!(full.is_transient());
        assert_eq!(
            full.to_string(),
            "acquire queue is full (4 waiting, limit 4)"
        );
        assert!(!PoolError::Closed.is_transient());
        assert!(!PoolError::LeaseExpired(Uuid::nil()).is_transient());
    }
}
