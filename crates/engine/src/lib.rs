//! # ProcPool Engine
//!
//! Launches and supervises subprocesses for the ProcPool worker pool.
//!
//! ## Overview
//!
//! - **Single-shot execution**: run a command to completion with bounded
//!   output capture and a timeout
//! - **Interactive sessions**: long-lived processes over pipes or a PTY,
//!   with stdin access and continuously drained output
//! - **Shutdown escalation**: soft timeout, polite signal, grace period,
//!   then force-kill of the whole process tree
//! - **Diagnostics**: truncation and streaming events from output sinks
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      ProcessEngine                         │
//! │        execute(ExecRequest)    start_session(SessionSpec)  │
//! ├───────────────────────────┬────────────────────────────────┤
//! │  drain tasks ──► sinks    │  ShutdownExecutor              │
//! │  (one per stream)         │    └─► ProcessTerminator       │
//! │       │                   │                                │
//! │       └─► Diagnostics     │  TerminalController (PTY/noop) │
//! └───────────────────────────┴────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use engine::{ExecRequest, OutputCapture, ProcessEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), engine::EngineError> {
//!     let engine = ProcessEngine::new();
//!     let result = engine
//!         .execute(
//!             ExecRequest::new(["echo", "hello"])
//!                 .with_timeout(Duration::from_secs(5))
//!                 .with_capture(OutputCapture::bounded(1024)),
//!         )
//!         .await?;
//!     assert_eq!(result.stdout.trim(), "hello");
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: `ProcessEngine`, requests and results
//! - [`session`]: interactive sessions
//! - [`shutdown`]: the escalation state machine
//! - [`terminate`]: signal delivery and process-tree discovery
//! - [`terminal`]: PTY and no-op terminal controllers
//! - [`sink`]: bounded, discard and streaming output sinks
//! - [`drain`]: stream pumps
//! - [`diagnostics`]: events and listeners
//! - [`plan`]: shutdown plans and signals

pub mod diagnostics;
pub mod drain;
pub mod engine;
pub mod error;
pub mod plan;
pub mod process;
pub mod session;
pub mod shutdown;
pub mod sink;
pub mod terminal;
pub mod terminate;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use diagnostics::{Charset, DiagnosticsEvent, DiagnosticsListener, StreamKind};
pub use drain::{drain, drain_blocking, DrainHandle};
pub use engine::{ExecRequest, ExecResult, ProcessEngine, TIMEOUT_EXIT_CODE};
pub use error::{EngineError, SessionError};
pub use plan::{ShutdownPlan, ShutdownSignal};
pub use process::ChildProcess;
pub use session::{InteractiveSession, PtyDimensions, SessionId, SessionSpec};
pub use shutdown::{ShutdownExecutor, ShutdownOutcome, TerminationState};
pub use sink::{
    BoundedOutputSink, DiscardOutputSink, OutputCapture, OutputSink, SinkHandle,
    StreamingOutputSink,
};
pub use terminal::{NoopTerminalController, PtyTerminalController, TerminalController};
pub use terminate::{ProcessTerminator, TreeAwareTerminator};

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock_unpoisoned<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
