//! Post-request retirement decisions.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::lease::LeaseScope;

/// What the caller reports when releasing a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// The request completed and the worker is in a clean state.
    Success,
    /// The request failed but the worker is believed to be usable.
    Failure,
    /// The caller gave up; worker state is unknown.
    Abandoned,
}

/// Why a worker was removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    TimedOut,
    Crashed,
    WarmupFailed,
    MaxUsesExceeded,
    Explicit,
}

impl RetireReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RetireReason::TimedOut => "timed_out",
            RetireReason::Crashed => "crashed",
            RetireReason::WarmupFailed => "warmup_failed",
            RetireReason::MaxUsesExceeded => "max_uses_exceeded",
            RetireReason::Explicit => "explicit",
        }
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict computed after each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum RetireDecision {
    Keep,
    Retire(RetireReason),
}

impl RetireDecision {
    pub fn is_keep(self) -> bool {
        matches!(self, RetireDecision::Keep)
    }

    pub fn reason(self) -> Option<RetireReason> {
        match self {
            RetireDecision::Keep => None,
            RetireDecision::Retire(reason) => Some(reason),
        }
    }
}

/// Inputs to the built-in retirement rules.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetireContext {
    pub alive: bool,
    /// Uses including the request just finished.
    pub uses: u64,
    pub max_uses: Option<u64>,
    /// Time since the worker was launched.
    pub age: Duration,
    pub max_lifetime: Option<Duration>,
}

/// Applies the built-in rules, then `policy` if they keep the worker.
pub(crate) fn decide<F>(
    scope: &LeaseScope,
    outcome: RequestOutcome,
    ctx: RetireContext,
    policy: Option<F>,
) -> RetireDecision
where
    F: Fn(&LeaseScope, RequestOutcome) -> RetireDecision,
{
    if !ctx.alive {
        return RetireDecision::Retire(RetireReason::Crashed);
    }
    if outcome == RequestOutcome::Abandoned {
        return RetireDecision::Retire(RetireReason::Explicit);
    }
    if matches!(ctx.max_uses, Some(max) if ctx.uses >= max) {
        return RetireDecision::Retire(RetireReason::MaxUsesExceeded);
    }
    // Outlived workers leave through the explicit path.
    if matches!(ctx.max_lifetime, Some(max) if ctx.age >= max) {
        return RetireDecision::Retire(RetireReason::Explicit);
    }
    match policy {
        Some(policy) => policy(scope, outcome),
        None => RetireDecision::Keep,
    }
}
