use crate::config::WorkerConfig;
use crate::failure::FailureClass;
use rand::Rng;
use std::time::Duration;

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryVerdict {
    Retry {
        delay: Duration,
        /// Timeout for the next attempt; stretched after a hard timeout.
        timeout_seconds: u32,
    },
    Terminal {
        reason: &'static str,
    },
}

/// Bounded retries with capped exponential backoff and full jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_seconds: u64,
    pub max_seconds: u64,
    pub timeout_multiplier: f64,
    pub timeout_cap_seconds: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 30,
            max_seconds: 900,
            timeout_multiplier: 1.5,
            timeout_cap_seconds: 1800,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            base_seconds: config.retry_base_seconds,
            max_seconds: config.retry_max_seconds,
            timeout_multiplier: config.timeout_retry_multiplier,
            timeout_cap_seconds: config.timeout_retry_cap_seconds,
        }
    }

    pub fn decide(
        &self,
        failure_class: FailureClass,
        attempt: u32,
        max_attempts: u32,
        timed_out: bool,
        timeout_seconds: u32,
    ) -> RetryVerdict {
        if !failure_class.is_retryable() {
            return RetryVerdict::Terminal {
                reason: "failure class is not retryable",
            };
        }
        if attempt >= max_attempts {
            return RetryVerdict::Terminal {
                reason: "retry budget exhausted",
            };
        }
        let timeout_seconds = if timed_out {
            self.stretched_timeout(timeout_seconds)
        } else {
            timeout_seconds
        };
        RetryVerdict::Retry {
            delay: self.jittered_delay(attempt),
            timeout_seconds,
        }
    }

    /// `min(max, base * 2^(attempt-1))`.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let seconds = self
            .base_seconds
            .saturating_mul(1_u64 << exponent)
            .min(self.max_seconds);
        Duration::from_secs(seconds)
    }

    /// Uniform in `[0, backoff_ceiling(attempt)]`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = u64::try_from(self.backoff_ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=ceiling_ms))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn stretched_timeout(&self, timeout_seconds: u32) -> u32 {
        // Never shrink a timeout that is already above the cap.
        if timeout_seconds >= self.timeout_cap_seconds {
            return timeout_seconds;
        }
        let stretched = (f64::from(timeout_seconds) * self.timeout_multiplier).ceil();
        let capped = stretched.min(f64::from(self.timeout_cap_seconds));
        (capped as u32).max(timeout_seconds)
    }
}
