//! Retry budgets and the exponential backoff schedule.

use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Longest single backoff sleep; keeps `base^idx` finite for large budgets.
pub const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Bounded retry budget for one layer (transport or parse).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Sleep `backoff_base_secs ^ attempt_index` seconds between attempts.
    /// `0` disables sleeping entirely.
    pub backoff_base_secs: f64,

    /// Wall-clock limit for a single backend call.
    pub attempt_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 2.0,
            attempt_timeout_secs: 120,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base_secs: f64, attempt_timeout_secs: u64) -> Self {
        Self {
            max_attempts,
            backoff_base_secs,
            attempt_timeout_secs,
        }
    }

    /// One attempt, no sleeping.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff_base_secs: 0.0,
            ..Self::default()
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be >= 1"));
        }
        let base = self.backoff_base_secs;
        if !base.is_finite() || (base != 0.0 && base < 1.0) {
            return Err(anyhow!(
                "backoff_base_secs must be 0 or a finite value >= 1 (got {base})"
            ));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(anyhow!("attempt_timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Sleep before the retry that follows attempt `attempt_index` (0-based).
    ///
    /// Non-decreasing in `attempt_index` for every valid policy.
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        if self.backoff_base_secs <= 0.0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let secs = self.backoff_base_secs.powi(exponent);
        if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
            return MAX_BACKOFF;
        }
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_from_one_second() {
        let policy = RetryPolicy::new(4, 2.0, 10);
        let delays: Vec<_> = (0..4).map(|idx| policy.delay_for(idx)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn zero_base_never_sleeps() {
        let policy = RetryPolicy::new(5, 0.0, 10);
        assert!((0..5).all(|idx| policy.delay_for(idx).is_zero()));
    }

    #[test]
    fn huge_exponents_are_capped() {
        let policy = RetryPolicy::new(u32::MAX, 10.0, 10);
        assert_eq!(policy.delay_for(400), MAX_BACKOFF);
        assert!(policy.delay_for(3) <= policy.delay_for(4));
    }

    #[test]
    fn validate_rejects_bad_budgets() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::once().validate().is_ok());
        assert!(RetryPolicy::new(0, 2.0, 10).validate().is_err());
        assert!(RetryPolicy::new(3, 0.5, 10).validate().is_err());
        assert!(RetryPolicy::new(3, f64::NAN, 10).validate().is_err());
        assert!(RetryPolicy::new(3, 2.0, 0).validate().is_err());
    }
}
