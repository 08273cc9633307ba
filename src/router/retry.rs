//! Bounded exponential backoff.

use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;

/// Retry budget for transient shard errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()));
        if self.jitter && !capped.is_zero() {
            let low = capped / 2;
            rand::thread_rng().gen_range(low..=capped)
        } else {
            capped
        }
    }

    /// Whether another retry is allowed after `attempt` retries.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.multiplier >= 1.0) {
            return Err(Error::Config("retry multiplier must be >= 1.0".to_string()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::Config("initial_backoff exceeds max_backoff".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default().with_jitter(false);
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(20), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            let ceiling = RetryPolicy::default().with_jitter(false).backoff(attempt);
            let delay = policy.backoff(attempt);
            assert!(delay <= ceiling && delay >= ceiling / 2);
        }
    }

    #[test]
    fn test_budget() {
        let policy = RetryPolicy::default().with_max_retries(2);
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
        assert!(!RetryPolicy::none().allows(0));
    }
}
