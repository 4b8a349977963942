//! Retry policy for failed datastore operations

use crate::classify::{Classification, ErrorKind};
use std::time::Duration;
use tracing::{info, warn};

/// Retry strategy for failed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// No retries
    None,

    /// Fixed delay between retries
    Fixed,

    /// Exponential backoff
    Exponential,

    /// Exponential backoff with jitter
    ExponentialWithJitter,
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Retry strategy to use
    pub strategy: RetryStrategy,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Relative jitter applied to each delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            strategy: RetryStrategy::ExponentialWithJitter,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Load the policy from `CONCIERGE_DB_RETRY_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let max_attempts = lookup("CONCIERGE_DB_RETRY_MAX_ATTEMPTS")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.max_attempts);
        let max_attempts = if max_attempts == 0 {
            warn!("Invalid retry max_attempts=0, using default={}", defaults.max_attempts);
            defaults.max_attempts
        } else {
            max_attempts
        };

        let base_delay = lookup("CONCIERGE_DB_RETRY_BASE_DELAY_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay);

        let max_delay = lookup("CONCIERGE_DB_RETRY_MAX_DELAY_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay);
        let max_delay = if max_delay < base_delay {
            warn!(
                base_delay_ms = base_delay.as_millis() as u64,
                max_delay_ms = max_delay.as_millis() as u64,
                "Retry max_delay is below base_delay, clamping to base_delay"
            );
            base_delay
        } else {
            max_delay
        };

        let jitter = lookup("CONCIERGE_DB_RETRY_JITTER")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(defaults.jitter);
        let jitter = if (0.0..=1.0).contains(&jitter) {
            jitter
        } else {
            warn!(jitter, "Invalid retry jitter, using default={}", defaults.jitter);
            defaults.jitter
        };

        let policy = Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter,
            ..defaults
        };

        info!(
            max_attempts = policy.max_attempts,
            base_delay_ms = policy.base_delay.as_millis() as u64,
            max_delay_ms = policy.max_delay.as_millis() as u64,
            jitter = policy.jitter,
            "Retry policy loaded"
        );

        policy
    }

    /// Delay before retrying after failed attempt `attempt` (1-based), before
    /// jitter: `min(base * multiplier^(attempt-1), max_delay)`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed => self.base_delay.min(self.max_delay),
            RetryStrategy::Exponential | RetryStrategy::ExponentialWithJitter => {
                let delay = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
                let capped = delay.min(self.max_delay.as_secs_f64());
                if capped.is_finite() && capped >= 0.0 {
                    Duration::from_secs_f64(capped)
                } else {
                    self.max_delay
                }
            }
        }
    }

    /// Apply jitter to the delay for `attempt`. `sample` is drawn from
    /// `[-1.0, 1.0]`; the result stays within `[0, max_delay]`.
    pub fn backoff_delay(&self, attempt: u32, sample: f64) -> Duration {
        let delay = self.calculate_delay(attempt);
        if self.strategy != RetryStrategy::ExponentialWithJitter || self.jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + self.jitter * sample.clamp(-1.0, 1.0);
        let jittered = (delay.as_secs_f64() * factor).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(jittered)
    }

    /// Delay before the next attempt, honoring a rate-limit hint
    pub fn next_delay(&self, attempt: u32, classification: &Classification) -> Duration {
        let sample = rand::random::<f64>() * 2.0 - 1.0;
        let delay = self.backoff_delay(attempt, sample);
        match (classification.kind, classification.retry_after) {
            (ErrorKind::RateLimit, Some(hint)) => delay.max(hint),
            _ => delay,
        }
    }

    /// Check if another attempt is allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.strategy != RetryStrategy::None && attempt < self.max_attempts
    }
}

/// Decide whether a failed attempt should be retried. Pure.
pub fn should_retry(classification: &Classification, attempt: u32, policy: &RetryPolicy) -> bool {
    classification.retryable && policy.should_retry(attempt)
}
