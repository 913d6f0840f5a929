//! Retry and backoff policy.
//!
//! The decision is a pure function of the attempt counters; the queue applies
//! the returned delay before redelivering.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::DEFAULT_MAX_ATTEMPTS;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// Doubling: base * 2^(retry - 1)
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt budget applied to new jobs
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to `Pending`; the queue redelivers after `delay`.
    Requeue { delay: Duration },
    /// Budget exhausted; the job becomes `Failed`.
    Fail,
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with doubling delays.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the given retry (1-indexed). Retry 0 means "no retry yet".
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Decide between requeue and permanent failure.
    ///
    /// `attempts` is the value returned by the claim (already incremented), so
    /// the retry about to be scheduled is number `attempts`.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        if attempts < max_attempts {
            RetryDecision::Requeue {
                delay: self.delay_for_retry(attempts),
            }
        } else {
            RetryDecision::Fail
        }
    }
}
