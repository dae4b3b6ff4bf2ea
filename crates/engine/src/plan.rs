//! Shutdown plans.
//!
//! A [`ShutdownPlan`] describes how long a supervised process may run before
//! it is asked to stop, which signal asks it, and how long it gets to comply
//! before it is force-killed.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Signal used for the polite step of the escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownSignal {
    /// SIGINT, or Ctrl+C on a terminal.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGKILL.
    Kill,
}

impl ShutdownSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "interrupt",
            ShutdownSignal::Terminate => "terminate",
            ShutdownSignal::Kill => "kill",
        }
    }

    /// Whether the signal cannot be caught by the target.
    pub fn is_forceful(self) -> bool {
        matches!(self, ShutdownSignal::Kill)
    }

    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;

        match self {
            ShutdownSignal::Interrupt => Signal::SIGINT,
            ShutdownSignal::Terminate => Signal::SIGTERM,
            ShutdownSignal::Kill => Signal::SIGKILL,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable escalation parameters.
///
/// `soft_timeout` must be positive; `grace_period` may be zero, in which case
/// the force-kill follows the signal immediately if the process has not
/// already exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPlan {
    soft_timeout: Duration,
    grace_period: Duration,
    signal: ShutdownSignal,
}

impl ShutdownPlan {
    pub fn new(
        soft_timeout: Duration,
        grace_period: Duration,
        signal: ShutdownSignal,
    ) -> Result<Self, EngineError> {
        if soft_timeout.is_zero() {
            return Err(EngineError::InvalidPlan(
                "soft timeout must be positive".to_string(),
            ));
        }
        Ok(Self {
            soft_timeout,
            grace_period,
            signal,
        })
    }

    pub fn soft_timeout(&self) -> Duration {
        self.soft_timeout
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal
    }

    /// Returns a copy with a different soft timeout.
    pub fn with_soft_timeout(self, soft_timeout: Duration) -> Result<Self, EngineError> {
        Self::new(soft_timeout, self.grace_period, self.signal)
    }

    /// Returns a copy with a different signal.
    pub fn with_signal(self, signal: ShutdownSignal) -> Self {
        Self { signal, ..self }
    }

    /// Upper bound on how long the escalation may wait before force-killing.
    pub fn total_budget(&self) -> Duration {
        self.soft_timeout + self.grace_period
    }
}

impl Default for ShutdownPlan {
    fn default() -> Self {
        Self {
            soft_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(5),
            signal: ShutdownSignal::Interrupt,
        }
    }
}
