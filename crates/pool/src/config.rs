//! Configuration management for ProcPool.
//!
//! [`PoolSettings`] is the serialisable part, loaded from TOML. The default
//! configuration path is `~/.config/procpool/config.toml`. [`PoolConfig`]
//! couples settings with hooks that cannot be serialised: the warmup
//! action, the retirement policy and the diagnostics listener.

use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use engine::{
    DiagnosticsListener, InteractiveSession, OutputCapture, PtyDimensions, SessionSpec,
    ShutdownPlan, ShutdownSignal,
};
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lease::LeaseScope;
use crate::retire::{RequestOutcome, RetireDecision};

/// Largest accepted pool size.
pub const MAX_POOL_SIZE: usize = 256;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("pool size must be between 1 and {MAX_POOL_SIZE}, got {0}")]
    InvalidPoolSize(usize),

    #[error("launch_retries must be between 1 and 100, got {0}")]
    InvalidLaunchRetries(u32),

    #[error("worker command must not be empty")]
    EmptyCommand,

    #[error("worker program not found: {0}")]
    InvalidCommand(String),

    #[error("working_dir is not a directory: {0}")]
    InvalidWorkingDir(PathBuf),

    #[error("pty size must be positive, got {0}x{1}")]
    InvalidPtySize(u16, u16),

    #[error("soft_timeout_ms must be greater than 0")]
    InvalidSoftTimeout,

    #[error("capture max_bytes must be greater than 0")]
    InvalidCaptureLimit,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Serialisable pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PoolSettings {
    /// Pool sizing and timeouts.
    pub pool: PoolSection,

    /// How each worker process is launched.
    pub worker: WorkerSection,

    /// Shutdown escalation for retired workers.
    pub shutdown: ShutdownSection,

    /// Output capture for worker sessions.
    pub capture: OutputCapture,

    /// Logging settings.
    pub logging: LoggingSection,
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolSection {
    /// Number of workers kept alive.
    pub size: usize,

    /// Leases served by one worker before it is retired (0 = unlimited).
    pub max_uses: u64,

    /// Default time `acquire` waits for an idle worker.
    pub acquire_timeout_ms: u64,

    /// Deadline for each lease (0 = no deadline).
    pub request_timeout_ms: u64,

    /// Attempts to produce a worker before giving up.
    pub launch_retries: u32,

    /// Callers allowed to wait in `acquire` at once (0 = unlimited).
    pub max_queue_depth: usize,

    /// Retire a worker left idle this long (0 = never).
    pub max_idle_time_ms: u64,

    /// Retire a worker this long after launch (0 = never).
    pub max_worker_lifetime_ms: u64,
}

/// Worker launch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSection {
    /// Program and arguments.
    pub command: Vec<String>,

    /// Working directory; inherited when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Launch on a pseudo-terminal instead of pipes.
    pub pty: bool,

    pub pty_cols: u16,

    pub pty_rows: u16,

    /// Send stderr into the stdout sink.
    pub merge_stderr: bool,

    /// Signal the whole process tree on shutdown.
    pub destroy_tree: bool,

    /// Close a worker after this long without input (0 = never).
    pub idle_timeout_ms: u64,
}

/// Shutdown escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownSection {
    pub soft_timeout_ms: u64,

    pub grace_period_ms: u64,

    /// interrupt, terminate or kill.
    pub signal: ShutdownSignal,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: 2,
            max_uses: 1000,
            acquire_timeout_ms: 30_000,
            request_timeout_ms: 300_000, // 5 minutes
            launch_retries: 5,
            max_queue_depth: 0,
            max_idle_time_ms: 0,
            max_worker_lifetime_ms: 0,
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: vec![default_shell()],
            working_dir: None,
            env: BTreeMap::new(),
            pty: false,
            pty_cols: 80,
            pty_rows: 24,
            merge_stderr: false,
            destroy_tree: true,
            idle_timeout_ms: 0,
        }
    }
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            soft_timeout_ms: 5_000,
            grace_period_ms: 1_000,
            signal: ShutdownSignal::Terminate,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("procpool")
        .join("config.toml")
}

/// Returns the default worker program for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl PoolSettings {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - PROCPOOL_POOL_SIZE: Override the pool size
    /// - PROCPOOL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("PROCPOOL_POOL_SIZE") {
            match size.trim().parse::<usize>() {
                Ok(size) => {
                    tracing::info!("Overriding pool size from environment: {}", size);
                    self.pool.size = size;
                }
                Err(_) if size.is_empty() => {}
                Err(e) => {
                    tracing::warn!("Ignoring invalid PROCPOOL_POOL_SIZE {:?}: {}", size, e);
                }
            }
        }

        if let Ok(level) = std::env::var("PROCPOOL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.size < 1 || self.pool.size > MAX_POOL_SIZE {
            return Err(ConfigError::InvalidPoolSize(self.pool.size));
        }

        if self.pool.launch_retries < 1 || self.pool.launch_retries > 100 {
            return Err(ConfigError::InvalidLaunchRetries(self.pool.launch_retries));
        }

        let program = self
            .worker
            .command
            .first()
            .ok_or(ConfigError::EmptyCommand)?;
        let program_path = Path::new(program);
        if program_path.components().count() > 1 {
            if !program_path.exists() {
                return Err(ConfigError::InvalidCommand(program.clone()));
            }
        } else if which::which(program).is_err() {
            return Err(ConfigError::InvalidCommand(program.clone()));
        }

        if let Some(dir) = &self.worker.working_dir {
            if !dir.is_dir() {
                return Err(ConfigError::InvalidWorkingDir(dir.clone()));
            }
        }

        if self.worker.pty && (self.worker.pty_cols == 0 || self.worker.pty_rows == 0) {
            return Err(ConfigError::InvalidPtySize(
                self.worker.pty_cols,
                self.worker.pty_rows,
            ));
        }

        if self.shutdown.soft_timeout_ms == 0 {
            return Err(ConfigError::InvalidSoftTimeout);
        }

        if let OutputCapture::Bounded { max_bytes: 0, .. } = self.capture {
            return Err(ConfigError::InvalidCaptureLimit);
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.acquire_timeout_ms)
    }

    /// Lease deadline, or `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.pool.request_timeout_ms > 0)
            .then(|| Duration::from_millis(self.pool.request_timeout_ms))
    }

    /// Reuse limit, or `None` when unlimited.
    pub fn max_uses(&self) -> Option<u64> {
        (self.pool.max_uses > 0).then_some(self.pool.max_uses)
    }

    /// Waiter limit, or `None` when unlimited.
    pub fn max_queue_depth(&self) -> Option<usize> {
        (self.pool.max_queue_depth > 0).then_some(self.pool.max_queue_depth)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        (self.pool.max_idle_time_ms > 0).then(|| Duration::from_millis(self.pool.max_idle_time_ms))
    }

    pub fn max_worker_lifetime(&self) -> Option<Duration> {
        (self.pool.max_worker_lifetime_ms > 0)
            .then(|| Duration::from_millis(self.pool.max_worker_lifetime_ms))
    }

    pub fn shutdown_plan(&self) -> Result<ShutdownPlan, ConfigError> {
        ShutdownPlan::new(
            Duration::from_millis(self.shutdown.soft_timeout_ms),
            Duration::from_millis(self.shutdown.grace_period_ms),
            self.shutdown.signal,
        )
        .map_err(|_| ConfigError::InvalidSoftTimeout)
    }

    /// Builds the launch spec shared by every worker.
    pub fn session_spec(&self, diagnostics: DiagnosticsListener) -> Result<SessionSpec, ConfigError> {
        let mut spec = SessionSpec::new(self.worker.command.iter().cloned())
            .with_capture(self.capture)
            .with_merged_stderr(self.worker.merge_stderr)
            .with_shutdown_plan(self.shutdown_plan()?)
            .with_destroy_tree(self.worker.destroy_tree)
            .with_diagnostics(diagnostics);
        spec.env = self
            .worker
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(dir) = &self.worker.working_dir {
            spec = spec.with_working_dir(dir);
        }
        if self.worker.pty {
            spec = spec.with_pty(PtyDimensions {
                cols: self.worker.pty_cols,
                rows: self.worker.pty_rows,
            });
        }
        if self.worker.idle_timeout_ms > 0 {
            spec = spec.with_idle_timeout(Duration::from_millis(self.worker.idle_timeout_ms));
        }
        Ok(spec)
    }

    /// Read configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from a file, or the defaults if it does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

/// Prepares a freshly launched worker before it is first leased.
pub type WarmupAction =
    Arc<dyn Fn(Arc<InteractiveSession>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Consulted after each request when the built-in rules keep the worker.
pub type RetirementPolicy =
    Arc<dyn Fn(&LeaseScope, RequestOutcome) -> RetireDecision + Send + Sync>;

/// Settings plus hooks.
#[derive(Clone, Default)]
pub struct PoolConfig {
    settings: PoolSettings,
    warmup: Option<WarmupAction>,
    retirement_policy: Option<RetirementPolicy>,
    diagnostics: DiagnosticsListener,
}

impl PoolConfig {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Runs `action` against every new worker; an error retires it.
    pub fn with_warmup<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(Arc<InteractiveSession>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.warmup = Some(Arc::new(move |session| action(session).boxed()));
        self
    }

    pub fn with_retirement_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&LeaseScope, RequestOutcome) -> RetireDecision + Send + Sync + 'static,
    {
        self.retirement_policy = Some(Arc::new(policy));
        self
    }

    pub fn with_diagnostics(mut self, listener: DiagnosticsListener) -> Self {
        self.diagnostics = listener;
        self
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut PoolSettings {
        &mut self.settings
    }

    pub fn warmup(&self) -> Option<&WarmupAction> {
        self.warmup.as_ref()
    }

    pub fn retirement_policy(&self) -> Option<&RetirementPolicy> {
        self.retirement_policy.as_ref()
    }

    pub fn diagnostics(&self) -> &DiagnosticsListener {
        &self.diagnostics
    }

    pub fn session_spec(&self) -> Result<SessionSpec, ConfigError> {
        self.settings.session_spec(self.diagnostics.clone())
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("settings", &self.settings)
            .field("warmup", &self.warmup.is_some())
            .field("retirement_policy", &self.retirement_policy.is_some())
            .finish()
    }
}
