//! Per-item exponential backoff for requeued work.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Delay for the n-th consecutive failure of an item is `base * 2^n`, capped at `max`.
///
/// Failure counts are tracked per item and cleared by [`forget`](Self::forget).
#[derive(Debug)]
pub struct ItemExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of `key` and return how long to wait before retrying it
    pub fn when(&self, key: &str) -> Duration {
        let exponent = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.to_string()).or_insert(0);
            let exponent = *count;
            *count = count.saturating_add(1);
            exponent
        };
        self.delay_for(exponent)
    }

    fn delay_for(&self, exponent: u32) -> Duration {
        let secs = self.base.as_secs_f64() * 2f64.powi(exponent.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_per_item() {
        let limiter = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(limiter.when("a"), Duration::from_millis(5));
        assert_eq!(limiter.when("a"), Duration::from_millis(10));
        assert_eq!(limiter.when("a"), Duration::from_millis(20));
        // other items have their own history
        assert_eq!(limiter.when("b"), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues("a"), 3);
        assert_eq!(limiter.num_requeues("b"), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let limiter = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        for _ in 0..200 {
            assert!(limiter.when("a") <= Duration::from_secs(1));
        }
        assert_eq!(limiter.when("a"), Duration::from_secs(1));
    }

    #[test]
    fn test_forget_resets_history() {
        let limiter = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        limiter.when("a");
        limiter.when("a");
        limiter.forget("a");
        assert_eq!(limiter.num_requeues("a"), 0);
        assert_eq!(limiter.when("a"), Duration::from_millis(5));
    }
}
