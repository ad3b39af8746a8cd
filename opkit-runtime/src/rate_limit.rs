//! Per-key exponential backoff for failed reconciles

use ahash::AHashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::{hash::Hash, time::Duration};

/// Tracks a failure attempt counter per key and turns it into a requeue
/// delay: `min(max_interval, min_interval * 2^attempt + jitter)` with
/// `jitter ∈ [0, base)`.
///
/// Capping after the jitter keeps the delay monotonic in the attempt count:
/// each uncapped base is at least the previous base plus its whole jitter
/// range, and once capped every delay is exactly `max_interval`.
#[derive(Debug)]
pub struct RateLimiter<T> {
    min_interval: Duration,
    max_interval: Duration,
    attempts: Mutex<AHashMap<T, u32>>,
}

impl<T: Eq + Hash + Clone> RateLimiter<T> {
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval,
            attempts: Mutex::new(AHashMap::new()),
        }
    }

    /// Record a failure for `key` and return the delay before the next attempt.
    ///
    /// The first failure uses attempt 0, i.e. a delay of roughly `min_interval`.
    pub fn fail(&self, key: &T) -> Duration {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let counter = attempts.entry(key.clone()).or_insert(0);
            let attempt = *counter;
            *counter = counter.saturating_add(1);
            attempt
        };
        self.delay(attempt)
    }

    /// The number of failures recorded for `key` since it was last forgotten.
    pub fn attempts(&self, key: &T) -> u32 {
        self.attempts.lock().get(key).copied().unwrap_or(0)
    }

    /// Clear the attempt counter for `key` after a successful reconcile.
    pub fn forget(&self, key: &T) {
        self.attempts.lock().remove(key);
    }

    /// The backoff delay for a given attempt count, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .min_interval
            .saturating_mul(2u32.saturating_pow(attempt.min(32)));
        if base >= self.max_interval {
            return self.max_interval;
        }
        let jitter = Duration::from_secs_f64(
            rand::thread_rng().gen_range(0.0..1.0) * base.as_secs_f64(),
        );
        (base + jitter).min(self.max_interval)
    }

    /// The delay for a given attempt without the jitter term, exposed so
    /// callers can reason about eligibility deadlines deterministically.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.min_interval
            .saturating_mul(2u32.saturating_pow(attempt.min(32)))
            .min(self.max_interval)
    }
}

impl<T: Eq + Hash + Clone> Default for RateLimiter<T> {
    /// Error requeue defaults: 1s doubling up to 10min
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::RateLimiter;
    use std::time::Duration;

    #[test]
    fn failures_advance_the_attempt_counter() {
        let limiter = RateLimiter::new(Duration::from_millis(100), Duration::from_secs(60));
        assert_eq!(limiter.attempts(&"k"), 0);
        limiter.fail(&"k");
        limiter.fail(&"k");
        assert_eq!(limiter.attempts(&"k"), 2);
        limiter.forget(&"k");
        assert_eq!(limiter.attempts(&"k"), 0);
    }

    #[test]
    fn delay_is_monotonic_in_attempts() {
        let limiter = RateLimiter::<&str>::new(Duration::from_millis(250), Duration::from_secs(30));
        for attempt in 0..20 {
            // the whole jitter range of an attempt stays below the next
            // attempt's floor, so sampled delays can never go backwards
            assert!(limiter.delay(attempt) <= limiter.base_delay(attempt + 1));
            assert!(limiter.base_delay(attempt) <= limiter.base_delay(attempt + 1));
        }
    }

    #[test]
    fn delay_saturates_at_max_interval() {
        let limiter = RateLimiter::<&str>::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(limiter.base_delay(3), Duration::from_secs(8));
        assert_eq!(limiter.delay(30), Duration::from_secs(8));
        assert_eq!(limiter.delay(31), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_one_base_interval() {
        let limiter = RateLimiter::<&str>::new(Duration::from_millis(500), Duration::from_secs(3600));
        for _ in 0..100 {
            let d = limiter.delay(2);
            assert!(d >= Duration::from_secs(2));
            assert!(d < Duration::from_secs(4));
        }
    }

    #[test]
    fn keys_do_not_share_counters() {
        let limiter = RateLimiter::new(Duration::from_secs(1), Duration::from_secs(60));
        limiter.fail(&"a");
        limiter.fail(&"a");
        limiter.fail(&"b");
        assert_eq!(limiter.attempts(&"a"), 2);
        assert_eq!(limiter.attempts(&"b"), 1);
    }
}
