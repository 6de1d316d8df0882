//! Retry and backoff policy.
//!
//! A pure decision component: given the attempts made so far, the elapsed
//! time, and the failure that occurred, it answers "retry after delay D" or
//! "give up with kind F". The orchestrator owns the sleeping and the
//! cancellation; nothing here suspends.

use crate::types::{ErrorClass, FailureKind, ResearchError};
use rand::Rng;
use std::time::Duration;

/// Bounds for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts per retry sequence (default: 5)
    pub max_attempts: u32,

    /// Maximum wall-clock time per retry sequence (default: 5 minutes)
    pub max_elapsed: Duration,

    /// Base delay for the first backoff (default: 500 ms)
    pub base_delay: Duration,

    /// Upper bound on any single backoff delay (default: 30 seconds)
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_elapsed: Duration::from_secs(300),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Set the attempt bound.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the elapsed-time bound.
    pub fn with_max_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = elapsed;
        self
    }

    /// Set the base backoff delay.
    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    /// Set the per-delay cap.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }
}

/// Outcome of consulting the retry policy after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then run attempt number `attempt`.
    RetryAfter { delay: Duration, attempt: u32 },
    /// Stop retrying and report the failure.
    Abandon { kind: FailureKind },
}

/// Decide what to do after attempt number `attempt` failed with `error`,
/// `elapsed` into the retry sequence.
///
/// Permanent errors abandon immediately. Transient errors abandon once
/// either the attempt bound or the elapsed bound is exceeded; otherwise the
/// next attempt is scheduled with exponential backoff and jitter.
pub fn next_decision(
    attempt: u32,
    elapsed: Duration,
    error: &ResearchError,
    config: &RetryConfig,
) -> RetryDecision {
    match error.class() {
        ErrorClass::Permanent => RetryDecision::Abandon {
            kind: error.failure_kind(),
        },
        ErrorClass::Cancelled => RetryDecision::Abandon {
            kind: FailureKind::Cancelled,
        },
        ErrorClass::Transient => {
            if attempt >= config.max_attempts || elapsed >= config.max_elapsed {
                tracing::warn!(
                    attempt,
                    ?elapsed,
                    error = %error,
                    "retry bounds exhausted, abandoning"
                );
                RetryDecision::Abandon {
                    kind: error.failure_kind(),
                }
            } else {
                RetryDecision::RetryAfter {
                    delay: backoff_delay(attempt, config),
                    attempt: attempt + 1,
                }
            }
        }
    }
}

/// Exponential backoff with jitter: `base * 2^(attempt-1)` capped at
/// `max_delay`, then jittered into the upper half of the window so a delay
/// is never zero.
fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let cap = config
        .base_delay
        .saturating_mul(1u32 << exp)
        .min(config.max_delay);

    let cap_ms = cap.as_millis() as u64;
    if cap_ms < 2 {
        return cap;
    }
    let jittered = rand::rng().random_range(cap_ms / 2..=cap_ms);
    Duration::from_millis(jittered)
}
