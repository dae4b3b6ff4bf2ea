//! Error types for the engine crate.

use thiserror::Error;

use crate::plan::ShutdownSignal;

/// Boxed error used as the cause of an execution failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced while launching or supervising a process.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The command line was empty.
    #[error("command must not be empty")]
    EmptyCommand,

    /// The request carried values the engine cannot honour.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A shutdown plan was built with out-of-range durations.
    #[error("invalid shutdown plan: {0}")]
    InvalidPlan(String),

    /// The capture policy cannot be used for this kind of execution.
    #[error("output capture '{0}' is not supported for single-shot execution")]
    UnsupportedCapture(&'static str),

    /// The operating system refused to start the process.
    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    /// Supervision of a running process was lost.
    ///
    /// The process may still be alive; callers should force-kill `pid`.
    #[error("execution of pid {pid:?} failed: {message}")]
    ExecutionFailed {
        pid: Option<u32>,
        message: String,
        #[source]
        source: BoxError,
    },

    /// The shutdown escalation was interrupted or a wait failed.
    ///
    /// The process has already been force-killed when this is returned.
    #[error("shutdown of pid {pid:?} failed: {message}")]
    ShutdownFailed {
        pid: Option<u32>,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A signal could not be delivered.
    #[error("failed to deliver {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: ShutdownSignal,
        #[source]
        source: nix::errno::Errno,
    },

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn spawn_failed(program: &str, reason: impl ToString) -> Self {
        EngineError::SpawnFailed {
            program: program.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors from operations on an interactive session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already terminated: {0}")]
    AlreadyTerminated(String),

    #[error("stdin of session {0} is closed")]
    StdinClosed(String),

    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    #[error("failed to signal session: {0}")]
    SignalFailed(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
