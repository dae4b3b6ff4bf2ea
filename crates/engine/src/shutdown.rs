//! Shutdown escalation.
//!
//! ```text
//! RUNNING --soft timeout--> SIGNALED --grace period--> KILLED
//!    \                          \
//!     +--------exit-------------+--> EXITED
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::EngineError;
use crate::plan::{ShutdownPlan, ShutdownSignal};
use crate::process::ChildProcess;
use crate::terminate::{ProcessTerminator, TreeAwareTerminator};

/// How long to wait for the kernel to reap a force-killed process.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal state of an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationState {
    /// Exited before any signal was sent.
    Exited,
    /// Exited after the plan's signal, within the grace period.
    Signaled,
    /// Force-killed, or exited after a KILL plan signal.
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub state: TerminationState,
    /// Exit code observed when the process was reaped.
    pub exit_code: Option<i32>,
    /// Number of terminator invocations.
    pub terminations: u32,
}

impl ShutdownOutcome {
    fn exited(code: i32) -> Self {
        Self {
            state: TerminationState::Exited,
            exit_code: Some(code),
            terminations: 0,
        }
    }

    /// True if the process finished without being signalled.
    pub fn exited_naturally(&self) -> bool {
        self.state == TerminationState::Exited
    }
}

enum Wait {
    Exited(i32),
    Elapsed,
    Cancelled,
    Failed(io::Error),
}

/// Supervises a process through a [`ShutdownPlan`].
#[derive(Clone)]
pub struct ShutdownExecutor {
    terminator: Arc<dyn ProcessTerminator>,
}

impl ShutdownExecutor {
    pub fn new(terminator: Arc<dyn ProcessTerminator>) -> Self {
        Self { terminator }
    }

    pub fn terminator(&self) -> &Arc<dyn ProcessTerminator> {
        &self.terminator
    }

    /// Waits for `process` to exit, escalating per `plan`.
    pub async fn await_completion(
        &self,
        process: &mut ChildProcess,
        plan: &ShutdownPlan,
        destroy_tree: bool,
    ) -> Result<ShutdownOutcome, EngineError> {
        self.await_completion_until(process, plan, destroy_tree, &CancellationToken::new())
            .await
    }

    /// Like [`await_completion`](Self::await_completion), but cancelling
    /// `cancel` interrupts the wait.
    ///
    /// Interruption or a failed wait force-kills the process before
    /// returning [`EngineError::ShutdownFailed`].
    pub async fn await_completion_until(
        &self,
        process: &mut ChildProcess,
        plan: &ShutdownPlan,
        destroy_tree: bool,
        cancel: &CancellationToken,
    ) -> Result<ShutdownOutcome, EngineError> {
        let pid = process.pid();

        match wait_for(process, plan.soft_timeout(), cancel).await {
            Wait::Exited(code) => return Ok(ShutdownOutcome::exited(code)),
            Wait::Elapsed => {}
            Wait::Cancelled => {
                return Err(self
                    .abort(process, destroy_tree, "interrupted while awaiting exit", None)
                    .await)
            }
            Wait::Failed(e) => {
                return Err(self
                    .abort(process, destroy_tree, "failed while awaiting exit", Some(e))
                    .await)
            }
        }

        debug!(?pid, signal = %plan.signal(), "soft timeout elapsed, signalling process");
        if let Err(e) = self.signal(process, plan.signal(), destroy_tree) {
            warn!(?pid, error = %e, "failed to deliver shutdown signal");
        }

        match wait_for(process, plan.grace_period(), cancel).await {
            Wait::Exited(code) => {
                let state = if plan.signal().is_forceful() {
                    TerminationState::Killed
                } else {
                    TerminationState::Signaled
                };
                return Ok(ShutdownOutcome {
                    state,
                    exit_code: Some(code),
                    terminations: 1,
                });
            }
            Wait::Elapsed => {}
            Wait::Cancelled => {
                return Err(self
                    .abort(process, destroy_tree, "interrupted during grace period", None)
                    .await)
            }
            Wait::Failed(e) => {
                return Err(self
                    .abort(process, destroy_tree, "failed during grace period", Some(e))
                    .await)
            }
        }

        debug!(?pid, "grace period elapsed, force-killing process");
        let mut outcome = self.kill_and_reap(process, destroy_tree).await?;
        outcome.terminations += 1;
        Ok(outcome)
    }

    /// Skips the escalation and kills immediately.
    pub async fn force_kill(
        &self,
        process: &mut ChildProcess,
        destroy_tree: bool,
    ) -> Result<ShutdownOutcome, EngineError> {
        if let Some(code) = process.try_exit_code()? {
            return Ok(ShutdownOutcome::exited(code));
        }
        self.kill_and_reap(process, destroy_tree).await
    }

    async fn kill_and_reap(
        &self,
        process: &mut ChildProcess,
        destroy_tree: bool,
    ) -> Result<ShutdownOutcome, EngineError> {
        let pid = process.pid();
        if let Err(e) = self.signal(process, ShutdownSignal::Kill, destroy_tree) {
            warn!(?pid, error = %e, "kill signal failed, killing through child handle");
            process.kill_direct()?;
        }
        match tokio::time::timeout(REAP_TIMEOUT, process.wait_exit()).await {
            Ok(Ok(code)) => Ok(ShutdownOutcome {
                state: TerminationState::Killed,
                exit_code: Some(code),
                terminations: 1,
            }),
            Ok(Err(e)) => Err(EngineError::ShutdownFailed {
                pid,
                message: "failed to reap killed process".to_string(),
                source: Some(e),
            }),
            Err(_) => {
                error!(?pid, "process survived SIGKILL");
                Err(EngineError::ShutdownFailed {
                    pid,
                    message: "process did not exit after SIGKILL".to_string(),
                    source: None,
                })
            }
        }
    }

    fn signal(
        &self,
        process: &mut ChildProcess,
        signal: ShutdownSignal,
        destroy_tree: bool,
    ) -> Result<(), EngineError> {
        match process.pid() {
            Some(pid) => self.terminator.terminate(pid, signal, destroy_tree),
            // A pipe child without a pid has already been reaped.
            None if !process.is_pty() => Ok(()),
            None => Ok(process.kill_direct()?),
        }
    }

    async fn abort(
        &self,
        process: &mut ChildProcess,
        destroy_tree: bool,
        message: &str,
        source: Option<io::Error>,
    ) -> EngineError {
        let pid = process.pid();
        error!(?pid, reason = message, "lost supervision, force-killing process");
        if let Err(e) = self.signal(process, ShutdownSignal::Kill, destroy_tree) {
            warn!(?pid, error = %e, "force kill after interruption failed");
            let _ = process.kill_direct();
        }
        // Reap promptly so no zombie is left behind; the error is returned either way.
        let _ = tokio::time::timeout(REAP_TIMEOUT, process.wait_exit()).await;
        EngineError::ShutdownFailed {
            pid,
            message: message.to_string(),
            source,
        }
    }
}

impl Default for ShutdownExecutor {
    fn default() -> Self {
        Self::new(Arc::new(TreeAwareTerminator))
    }
}

impl std::fmt::Debug for ShutdownExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownExecutor").finish_non_exhaustive()
    }
}

async fn wait_for(process: &mut ChildProcess, limit: Duration, cancel: &CancellationToken) -> Wait {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Wait::Cancelled,
        result = tokio::time::timeout(limit, process.wait_exit()) => match result {
            Ok(Ok(code)) => Wait::Exited(code),
            Ok(Err(e)) => Wait::Failed(e),
            Err(_) => Wait::Elapsed,
        },
    }
}
