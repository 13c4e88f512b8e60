//! Retry policy carried by every job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between a faulted attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub retry_limit: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Upper bound on every delay
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self::immediate(0)
    }

    /// Retry right away, up to `retry_limit` times.
    pub fn immediate(retry_limit: u32) -> Self {
        Self::fixed(retry_limit, Duration::ZERO)
    }

    /// Create a policy with fixed delays.
    pub fn fixed(retry_limit: u32, delay: Duration) -> Self {
        Self {
            retry_limit,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(retry_limit: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            retry_limit,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the attempt with the given retry number (1-indexed; retry 0 is
    /// the first attempt and never waits). Every strategy is capped at `max_delay`,
    /// jitter included.
    pub fn delay_for_retry(&self, retry_number: u32) -> Duration {
        if retry_number == 0 {
            return Duration::ZERO;
        }

        let backoff = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry_number),
            BackoffStrategy::Exponential => {
                let factor = 1_u32.checked_shl(retry_number - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
        .min(self.max_delay);

        let offset = self.jitter_offset(retry_number);
        if offset == 0.0 {
            return backoff;
        }
        Duration::try_from_secs_f64(backoff.as_secs_f64() * (1.0 + offset))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Offset in `[-jitter, jitter]`. Derived from the retry number so every node
    /// computes the same delay for a retry.
    fn jitter_offset(&self, retry_number: u32) -> f64 {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return 0.0;
        }
        let bucket = retry_number.wrapping_mul(0x9E37_79B9) >> 22;
        let unit = f64::from(bucket) / 1023.0;
        jitter * (unit * 2.0 - 1.0)
    }

    /// Whether a job that already used `retry_count` retries may retry again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.retry_limit
    }
}
