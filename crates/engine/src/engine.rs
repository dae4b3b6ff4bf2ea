//! The process engine.
//!
//! [`ProcessEngine::execute`] runs a command to completion with its output
//! captured; [`ProcessEngine::start_session`] launches an
//! [`InteractiveSession`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::diagnostics::{DiagnosticsListener, StreamKind};
use crate::drain::{drain, DrainHandle};
use crate::error::EngineError;
use crate::plan::ShutdownPlan;
use crate::process::{merged_pipe, ChildProcess};
use crate::session::{configure, InteractiveSession, SessionSpec};
use crate::shutdown::ShutdownExecutor;
use crate::sink::{OutputCapture, SinkHandle};
use crate::terminate::{ProcessTerminator, TreeAwareTerminator};

/// Exit code reported when a request timed out and no real status was
/// observed.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// A single-shot command execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Soft timeout of the shutdown escalation.
    pub timeout: Duration,
    pub capture: OutputCapture,
    pub merge_stderr: bool,
    /// Signal and grace period; its soft timeout is replaced by `timeout`.
    pub shutdown: ShutdownPlan,
    pub destroy_tree: bool,
    pub diagnostics: DiagnosticsListener,
}

impl ExecRequest {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shutdown = ShutdownPlan::default();
        Self {
            command: command.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: Vec::new(),
            timeout: shutdown.soft_timeout(),
            capture: OutputCapture::default(),
            merge_stderr: false,
            shutdown,
            destroy_tree: true,
            diagnostics: DiagnosticsListener::noop(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_capture(mut self, capture: OutputCapture) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_merged_stderr(mut self, merge: bool) -> Self {
        self.merge_stderr = merge;
        self
    }

    pub fn with_shutdown_plan(mut self, plan: ShutdownPlan) -> Self {
        self.shutdown = plan;
        self
    }

    pub fn with_destroy_tree(mut self, destroy_tree: bool) -> Self {
        self.destroy_tree = destroy_tree;
        self
    }

    pub fn with_diagnostics(mut self, listener: DiagnosticsListener) -> Self {
        self.diagnostics = listener;
        self
    }
}

/// Outcome of [`ProcessEngine::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Exit code, `128 + n` for signal `n`, or [`TIMEOUT_EXIT_CODE`].
    pub exit_code: i32,
    pub stdout: String,
    /// Empty when stderr was merged into stdout.
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Launches and supervises processes.
#[derive(Clone, Debug, Default)]
pub struct ProcessEngine {
    shutdown: ShutdownExecutor,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self::with_terminator(Arc::new(TreeAwareTerminator))
    }

    pub fn with_terminator(terminator: Arc<dyn ProcessTerminator>) -> Self {
        Self {
            shutdown: ShutdownExecutor::new(terminator),
        }
    }

    pub fn shutdown_executor(&self) -> &ShutdownExecutor {
        &self.shutdown
    }

    /// Runs `request` to completion.
    pub async fn execute(&self, request: ExecRequest) -> Result<ExecResult, EngineError> {
        self.execute_until(request, &CancellationToken::new()).await
    }

    /// Runs `request`; cancelling `cancel` kills the process and fails with
    /// [`EngineError::ExecutionFailed`].
    pub async fn execute_until(
        &self,
        request: ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, EngineError> {
        if let OutputCapture::Streaming { .. } = request.capture {
            return Err(EngineError::UnsupportedCapture(request.capture.name()));
        }
        if request.timeout.is_zero() {
            return Err(EngineError::InvalidRequest(
                "timeout must be positive".to_string(),
            ));
        }
        let plan = request.shutdown.with_soft_timeout(request.timeout)?;
        let (program, args) = request
            .command
            .split_first()
            .ok_or(EngineError::EmptyCommand)?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        configure(&mut cmd, request.working_dir.as_deref(), &request.env);

        let started = Instant::now();
        let (mut process, stdout, stderr, drains) = if request.merge_stderr {
            let sink = SinkHandle::from_capture(
                &request.capture,
                StreamKind::Merged,
                &request.diagnostics,
            )?;
            let (reader, out, err) = merged_pipe()?;
            cmd.stdout(out).stderr(err);
            let child = cmd
                .spawn()
                .map_err(|e| EngineError::spawn_failed(program, e))?;
            drop(cmd);
            let reader = tokio::net::unix::pipe::Receiver::from_file(reader)?;
            let drains = vec![drain(reader, sink.clone())];
            (ChildProcess::Pipe(child), sink, None, drains)
        } else {
            let out_sink = SinkHandle::from_capture(
                &request.capture,
                StreamKind::Stdout,
                &request.diagnostics,
            )?;
            let err_sink = SinkHandle::from_capture(
                &request.capture,
                StreamKind::Stderr,
                &request.diagnostics,
            )?;
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            let mut child = cmd
                .spawn()
                .map_err(|e| EngineError::spawn_failed(program, e))?;
            let mut drains = Vec::with_capacity(2);
            if let Some(out) = child.stdout.take() {
                drains.push(drain(out, out_sink.clone()));
            }
            if let Some(err) = child.stderr.take() {
                drains.push(drain(err, err_sink.clone()));
            }
            (ChildProcess::Pipe(child), out_sink, Some(err_sink), drains)
        };

        let pid = process.pid();
        debug!(?pid, program = %program, timeout_ms = request.timeout.as_millis() as u64, "Process started");

        let outcome = match self
            .shutdown
            .await_completion_until(&mut process, &plan, request.destroy_tree, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                abort_drains(drains);
                return Err(EngineError::ExecutionFailed {
                    pid,
                    message: "supervision interrupted".to_string(),
                    source: Box::new(e),
                });
            }
        };

        await_drains(drains, pid).await?;

        let timed_out = !outcome.exited_naturally();
        let exit_code = if timed_out {
            warn!(?pid, state = ?outcome.state, "Process exceeded its timeout");
            TIMEOUT_EXIT_CODE
        } else {
            outcome.exit_code.unwrap_or(TIMEOUT_EXIT_CODE)
        };

        Ok(ExecResult {
            exit_code,
            stdout: stdout.content(),
            stderr: stderr.map(|sink| sink.content()).unwrap_or_default(),
            duration: started.elapsed(),
            timed_out,
        })
    }

    /// Launches an interactive session. Must be called within a tokio
    /// runtime.
    pub fn start_session(&self, spec: &SessionSpec) -> Result<Arc<InteractiveSession>, EngineError> {
        InteractiveSession::launch(spec, self.shutdown.clone())
    }
}

async fn await_drains(drains: Vec<DrainHandle>, pid: Option<u32>) -> Result<(), EngineError> {
    let mut failure = None;
    for handle in drains {
        let stream = handle.stream();
        if let Err(e) = handle.wait().await {
            failure.get_or_insert((stream, e));
        }
    }
    match failure {
        None => Ok(()),
        Some((stream, e)) => Err(EngineError::ExecutionFailed {
            pid,
            message: format!("failed to drain {stream}"),
            source: Box::new(e),
        }),
    }
}

fn abort_drains(drains: Vec<DrainHandle>) {
    for handle in drains {
        handle.abort_handle().abort();
    }
}
