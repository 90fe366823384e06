//! Failure & retry controller
//!
//! Turns a handler failure into one of three decisions: try the same handler
//! again, degrade and move on, or end the session.

use crate::error::{FailureKind, FailureReport};
use crate::models::{HandlerId, Phase};
use crate::routing;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_RETRY_CEILING: u32 = 3;

/// Wait between retries of the same handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn none() -> Self {
        Backoff::Fixed(Duration::ZERO)
    }

    /// Delay after the `attempt`-th failed invocation (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_millis(250))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub default_ceiling: u32,
    pub ceilings: HashMap<HandlerId, u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn ceiling_for(&self, handler: HandlerId) -> u32 {
        self.ceilings
            .get(&handler)
            .copied()
            .unwrap_or(self.default_ceiling)
            .max(1)
    }

    pub fn with_ceiling(mut self, handler: HandlerId, ceiling: u32) -> Self {
        self.ceilings.insert(handler, ceiling);
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_ceiling: DEFAULT_RETRY_CEILING,
            ceilings: HashMap::new(),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Invoke the same handler again on the next turn
    Retry { delay: Duration },
    /// Mark the step failed and continue to `next`
    Degrade { next: Phase, reason: String },
    /// End the session in FAILED
    Abort(FailureReport),
}

pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `attempts` is the number of invocations of `handler` in this
    /// phase-entry, including the one that just failed.
    pub fn adjudicate(
        &self,
        handler: HandlerId,
        phase: Phase,
        attempts: u32,
        kind: FailureKind,
        detail: &str,
    ) -> Decision {
        match kind {
            FailureKind::Transient => {
                let ceiling = self.policy.ceiling_for(handler);
                if attempts < ceiling {
                    Decision::Retry {
                        delay: self.policy.backoff.delay(attempts),
                    }
                } else {
                    let escalated = format!(
                        "{} gave up after {} attempts: {}",
                        handler, attempts, detail
                    );
                    self.permanent(phase, escalated)
                }
            }
            FailureKind::Permanent => self.permanent(phase, detail.to_string()),
            FailureKind::Budget | FailureKind::Validation => {
                Decision::Abort(FailureReport::new(kind, detail))
            }
        }
    }

    fn permanent(&self, phase: Phase, reason: String) -> Decision {
        match routing::next_phase(phase) {
            Some(next) if !phase.is_critical() => Decision::Degrade { next, reason },
            _ => Decision::Abort(FailureReport::new(FailureKind::Permanent, reason)),
        }
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
