//! Interactive sessions.
//!
//! An [`InteractiveSession`] is a long-lived child process that accepts
//! input on stdin and has its output drained continuously into sinks. It is
//! started over plain pipes or on a pseudo-terminal, and stopped through the
//! shutdown escalation of its [`ShutdownPlan`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::diagnostics::{DiagnosticsListener, StreamKind};
use crate::drain::{drain, drain_blocking, DrainHandle};
use crate::error::{EngineError, SessionError};
use crate::lock_unpoisoned;
use crate::plan::{ShutdownPlan, ShutdownSignal};
use crate::process::{merged_pipe, ChildProcess};
use crate::shutdown::{ShutdownExecutor, ShutdownOutcome};
use crate::sink::{OutputCapture, SinkHandle};
use crate::terminal::{
    NoopTerminalController, PtyTerminalController, SharedWriter, TerminalController,
};

/// Unique identifier for a session.
pub type SessionId = String;

/// ASCII EOT, end of input on a terminal in canonical mode.
const CTRL_D: u8 = 0x04;

/// How long `close` waits for drains to reach EOF after the process exits.
const DRAIN_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// How often `wait` checks for exit between short holds of the process.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Terminal size for PTY sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyDimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyDimensions {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Everything needed to launch a session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub capture: OutputCapture,
    /// Send stderr into the stdout sink. Always true on a PTY.
    pub merge_stderr: bool,
    /// Launch on a PTY of this size instead of pipes.
    pub pty: Option<PtyDimensions>,
    pub shutdown: ShutdownPlan,
    pub destroy_tree: bool,
    /// Close the session after this long without input.
    pub idle_timeout: Option<Duration>,
    pub diagnostics: DiagnosticsListener,
}

impl SessionSpec {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: Vec::new(),
            capture: OutputCapture::default(),
            merge_stderr: false,
            pty: None,
            shutdown: ShutdownPlan::default(),
            destroy_tree: true,
            idle_timeout: None,
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

    pub fn with_capture(mut self, capture: OutputCapture) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_merged_stderr(mut self, merge: bool) -> Self {
        self.merge_stderr = merge;
        self
    }

    pub fn with_pty(mut self, dimensions: PtyDimensions) -> Self {
        self.pty = Some(dimensions);
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

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_diagnostics(mut self, listener: DiagnosticsListener) -> Self {
        self.diagnostics = listener;
        self
    }
}

enum SessionInput {
    Pipe(tokio::process::ChildStdin),
    Pty(SharedWriter),
}

/// Time since the last stdin activity.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

struct Launched {
    child: ChildProcess,
    input: SessionInput,
    stdout: SinkHandle,
    stderr: SinkHandle,
    drains: Vec<DrainHandle>,
    terminal: Box<dyn TerminalController>,
}

/// A running interactive process.
///
/// Shared through `Arc`; every method takes `&self`. Dropping the last
/// reference without closing kills the process.
pub struct InteractiveSession {
    id: SessionId,
    pid: Option<u32>,
    child: tokio::sync::Mutex<ChildProcess>,
    /// Set once by whoever first observes the exit.
    exit_code: OnceLock<i32>,
    input: tokio::sync::Mutex<Option<SessionInput>>,
    stdout: SinkHandle,
    stderr: SinkHandle,
    drains: Mutex<Vec<DrainHandle>>,
    terminal: Box<dyn TerminalController>,
    shutdown: ShutdownExecutor,
    plan: ShutdownPlan,
    destroy_tree: bool,
    closed: AtomicBool,
    activity: Activity,
    idle_cancel: CancellationToken,
}

impl InteractiveSession {
    /// Launches a session. Must be called within a tokio runtime.
    pub(crate) fn launch(
        spec: &SessionSpec,
        shutdown: ShutdownExecutor,
    ) -> Result<Arc<Self>, EngineError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or(EngineError::EmptyCommand)?;

        let launched = match spec.pty {
            Some(size) => launch_pty(spec, program, args, size, &shutdown)?,
            None => launch_pipe(spec, program, args)?,
        };

        let session = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            pid: launched.child.pid(),
            child: tokio::sync::Mutex::new(launched.child),
            exit_code: OnceLock::new(),
            input: tokio::sync::Mutex::new(Some(launched.input)),
            stdout: launched.stdout,
            stderr: launched.stderr,
            drains: Mutex::new(launched.drains),
            terminal: launched.terminal,
            shutdown,
            plan: spec.shutdown,
            destroy_tree: spec.destroy_tree,
            closed: AtomicBool::new(false),
            activity: Activity::new(),
            idle_cancel: CancellationToken::new(),
        });

        info!(
            session_id = %session.id,
            pid = ?session.pid,
            program = %program,
            pty = spec.pty.is_some(),
            "Session started"
        );

        if let Some(timeout) = spec.idle_timeout.filter(|t| !t.is_zero()) {
            session.watch_idle(timeout);
        }

        Ok(session)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_pty(&self) -> bool {
        self.terminal.is_pty()
    }

    /// Sink receiving stdout (or the merged stream).
    pub fn stdout(&self) -> &SinkHandle {
        &self.stdout
    }

    /// Sink receiving stderr. Same as `stdout()` when merged.
    pub fn stderr(&self) -> &SinkHandle {
        &self.stderr
    }

    pub fn terminal(&self) -> &dyn TerminalController {
        self.terminal.as_ref()
    }

    pub fn shutdown_plan(&self) -> &ShutdownPlan {
        &self.plan
    }

    /// Clears retained output on both streams.
    pub fn clear_output(&self) {
        self.stdout.clear();
        self.stderr.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Time since the last write to stdin.
    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    /// Writes to stdin.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let mut input = self.input.lock().await;
        match input.as_mut() {
            None => return Err(SessionError::StdinClosed(self.id.clone())),
            Some(SessionInput::Pipe(stdin)) => {
                stdin.write_all(data).await.map_err(write_failed)?;
                stdin.flush().await.map_err(write_failed)?;
            }
            Some(SessionInput::Pty(writer)) => {
                let mut writer = lock_unpoisoned(writer);
                writer.write_all(data).map_err(write_failed)?;
                writer.flush().map_err(write_failed)?;
            }
        }

        self.activity.touch();
        Ok(())
    }

    /// Writes `line` followed by a newline.
    pub async fn write_line(&self, line: &str) -> Result<(), SessionError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write(&data).await
    }

    /// Closes stdin. Idempotent.
    ///
    /// On a PTY this sends end-of-input instead, since the terminal stays
    /// open for output.
    pub async fn close_stdin(&self) -> Result<(), SessionError> {
        let input = self.input.lock().await.take();
        match input {
            Some(SessionInput::Pipe(mut stdin)) => {
                if let Err(e) = stdin.shutdown().await {
                    debug!(session_id = %self.id, error = %e, "stdin already closed by peer");
                }
            }
            Some(SessionInput::Pty(writer)) => {
                let mut writer = lock_unpoisoned(&writer);
                writer
                    .write_all(&[CTRL_D])
                    .and_then(|_| writer.flush())
                    .map_err(write_failed)?;
            }
            None => {}
        }
        self.activity.touch();
        Ok(())
    }

    pub fn send_signal(&self, signal: ShutdownSignal) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        self.terminal.send(signal)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        self.terminal.resize(cols, rows)
    }

    /// Exit code if the process has exited.
    pub async fn try_wait(&self) -> Result<Option<i32>, SessionError> {
        if let Some(code) = self.exit_code.get() {
            return Ok(Some(*code));
        }
        let code = self.child.lock().await.try_exit_code()?;
        if let Some(code) = code {
            self.record_exit(code);
        }
        Ok(code)
    }

    /// Waits for the process to exit.
    ///
    /// The process is only held for each check, never across the wait, so
    /// `close` and `kill` stay free to stop it while a caller is waiting.
    pub async fn wait(&self) -> Result<i32, SessionError> {
        loop {
            if let Some(code) = self.try_wait().await? {
                return Ok(code);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Whether the process is still running and the session open.
    ///
    /// A process under supervision by `close` counts as alive.
    pub fn is_alive(&self) -> bool {
        if self.is_closed() || self.exit_code.get().is_some() {
            return false;
        }
        match self.child.try_lock() {
            Ok(mut child) => match child.try_exit_code() {
                Ok(None) => true,
                Ok(Some(code)) => {
                    self.record_exit(code);
                    false
                }
                Err(_) => false,
            },
            Err(_) => true,
        }
    }

    fn record_exit(&self, code: i32) {
        let _ = self.exit_code.set(code);
    }

    /// Closes stdin and runs the shutdown escalation.
    ///
    /// Returns `None` if the session was already closed or killed.
    pub async fn close(&self) -> Result<Option<ShutdownOutcome>, EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.idle_cancel.cancel();

        if let Err(e) = self.close_stdin().await {
            debug!(session_id = %self.id, error = %e, "failed to close stdin");
        }

        let outcome = {
            let mut child = self.child.lock().await;
            self.shutdown
                .await_completion(&mut child, &self.plan, self.destroy_tree)
                .await
        };
        self.settle_drains().await;

        let outcome = outcome?;
        if let Some(code) = outcome.exit_code {
            self.record_exit(code);
        }
        info!(
            session_id = %self.id,
            state = ?outcome.state,
            exit_code = ?outcome.exit_code,
            "Session closed"
        );
        Ok(Some(outcome))
    }

    /// Kills the process immediately.
    ///
    /// Returns `None` if the session was already closed or killed.
    pub async fn kill(&self) -> Result<Option<ShutdownOutcome>, EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.idle_cancel.cancel();
        drop(self.input.lock().await.take());

        let outcome = {
            let mut child = self.child.lock().await;
            self.shutdown.force_kill(&mut child, self.destroy_tree).await
        };
        self.settle_drains().await;

        let outcome = outcome?;
        if let Some(code) = outcome.exit_code {
            self.record_exit(code);
        }
        info!(session_id = %self.id, exit_code = ?outcome.exit_code, "Session killed");
        Ok(Some(outcome))
    }

    async fn settle_drains(&self) {
        let drains = std::mem::take(&mut *lock_unpoisoned(&self.drains));
        for handle in drains {
            let stream = handle.stream();
            let abort = handle.abort_handle();
            match tokio::time::timeout(DRAIN_SETTLE_TIMEOUT, handle.wait()).await {
                Ok(Ok(bytes)) => {
                    debug!(session_id = %self.id, stream = %stream, bytes, "Drain finished")
                }
                // A PTY master reports EIO once the slave side is gone.
                Ok(Err(e)) => {
                    debug!(session_id = %self.id, stream = %stream, error = %e, "Drain ended")
                }
                Err(_) => {
                    abort.abort();
                    warn!(
                        session_id = %self.id,
                        stream = %stream,
                        "Output still open after exit, detaching drain"
                    );
                }
            }
        }
    }

    fn watch_idle(self: &Arc<Self>, timeout: Duration) {
        let weak = Arc::downgrade(self);
        let cancel = self.idle_cancel.clone();
        tokio::spawn(async move {
            let mut wait = timeout;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                let Some(session) = weak.upgrade() else {
                    return;
                };
                let idle = session.activity.idle_for();
                if idle >= timeout {
                    info!(session_id = %session.id, idle_ms = idle.as_millis() as u64, "Idle timeout reached");
                    if let Err(e) = session.close().await {
                        warn!(session_id = %session.id, error = %e, "Failed to close idle session");
                    }
                    return;
                }
                wait = timeout - idle;
            }
        });
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        self.idle_cancel.cancel();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Pipe children are killed by tokio on drop; PTY children are not.
        if let ChildProcess::Pty(child) = self.child.get_mut() {
            let _ = child.kill();
        }
    }
}

impl std::fmt::Debug for InteractiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveSession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("pty", &self.is_pty())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn write_failed(e: std::io::Error) -> SessionError {
    SessionError::WriteFailed(e.to_string())
}

/// Applies working directory, environment and process group to a command.
pub(crate) fn configure(
    cmd: &mut tokio::process::Command,
    working_dir: Option<&Path>,
    env: &[(String, String)],
) {
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    // Own process group so the whole tree can be signalled at once.
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.kill_on_drop(true);
}

fn launch_pipe(
    spec: &SessionSpec,
    program: &str,
    args: &[String],
) -> Result<Launched, EngineError> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args).stdin(Stdio::piped());
    configure(&mut cmd, spec.working_dir.as_deref(), &spec.env);

    if spec.merge_stderr {
        let sink = SinkHandle::from_capture(&spec.capture, StreamKind::Merged, &spec.diagnostics)?;
        let (reader, out, err) = merged_pipe()?;
        cmd.stdout(out).stderr(err);
        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::spawn_failed(program, e))?;
        // Release our copies of the write end so the reader sees EOF.
        drop(cmd);

        let stdin = take_stdin(&mut child, program)?;
        let reader = tokio::net::unix::pipe::Receiver::from_file(reader)?;
        let drains = vec![drain(reader, sink.clone())];
        return Ok(Launched {
            child: ChildProcess::Pipe(child),
            input: SessionInput::Pipe(stdin),
            stdout: sink.clone(),
            stderr: sink,
            drains,
            terminal: Box::new(NoopTerminalController),
        });
    }

    let stdout = SinkHandle::from_capture(&spec.capture, StreamKind::Stdout, &spec.diagnostics)?;
    let stderr = SinkHandle::from_capture(&spec.capture, StreamKind::Stderr, &spec.diagnostics)?;
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::spawn_failed(program, e))?;

    let stdin = take_stdin(&mut child, program)?;
    let out = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::spawn_failed(program, "stdout was not captured"))?;
    let err = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::spawn_failed(program, "stderr was not captured"))?;
    let drains = vec![drain(out, stdout.clone()), drain(err, stderr.clone())];

    Ok(Launched {
        child: ChildProcess::Pipe(child),
        input: SessionInput::Pipe(stdin),
        stdout,
        stderr,
        drains,
        terminal: Box::new(NoopTerminalController),
    })
}

fn take_stdin(
    child: &mut tokio::process::Child,
    program: &str,
) -> Result<tokio::process::ChildStdin, EngineError> {
    child
        .stdin
        .take()
        .ok_or_else(|| EngineError::spawn_failed(program, "stdin was not captured"))
}

fn launch_pty(
    spec: &SessionSpec,
    program: &str,
    args: &[String],
    size: PtyDimensions,
    shutdown: &ShutdownExecutor,
) -> Result<Launched, EngineError> {
    let sink = SinkHandle::from_capture(&spec.capture, StreamKind::Merged, &spec.diagnostics)?;

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| EngineError::spawn_failed(program, e))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    if let Some(dir) = &spec.working_dir {
        cmd.cwd(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| EngineError::spawn_failed(program, e))?;
    // Keep only the child's copy of the slave so EOF reaches the reader.
    drop(pair.slave);

    let io = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    let (reader, writer) = match io {
        Ok(io) => io,
        Err(e) => {
            let _ = child.kill();
            return Err(EngineError::spawn_failed(program, e));
        }
    };

    let pid = child.process_id();
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let drains = vec![drain_blocking(reader, sink.clone())];
    let terminal = PtyTerminalController::new(
        pair.master,
        Arc::clone(&writer),
        pid,
        Arc::clone(shutdown.terminator()),
        size.cols,
        size.rows,
    );

    Ok(Launched {
        child: ChildProcess::Pty(child),
        input: SessionInput::Pty(writer),
        stdout: sink.clone(),
        stderr: sink,
        drains,
        terminal: Box::new(terminal),
    })
}
