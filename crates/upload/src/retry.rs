use std::time::Duration;

use rand::Rng;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one fails.
    pub retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based), with ±25% jitter.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = retry.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25 * rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }

    fn within_jitter(actual: Duration, expected_ms: f64) -> bool {
        let ms = actual.as_secs_f64() * 1000.0;
        ms >= expected_ms * 0.75 - 0.001 && ms <= expected_ms * 1.25 + 0.001
    }

    #[test]
    fn attempts_include_first() {
        assert_eq!(policy().max_attempts(), 4);
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let p = policy();
        for _ in 0..20 {
            assert!(within_jitter(p.delay_for_attempt(1), 100.0));
            assert!(within_jitter(p.delay_for_attempt(2), 200.0));
            assert!(within_jitter(p.delay_for_attempt(3), 400.0));
        }
    }

    #[test]
    fn backoff_is_capped() {
        let p = policy();
        for _ in 0..20 {
            assert!(within_jitter(p.delay_for_attempt(10), 1000.0));
            assert!(within_jitter(p.delay_for_attempt(u32::MAX), 1000.0));
        }
    }

    #[test]
    fn zero_initial_delay_means_no_wait() {
        let p = RetryPolicy {
            initial_delay: Duration::ZERO,
            ..policy()
        };
        assert_eq!(p.delay_for_attempt(3), Duration::ZERO);
    }
}
