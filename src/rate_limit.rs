//! Throttling for code-redemption attempts
//!
//! Sliding window per device so promo and activation codes cannot be
//! brute-forced from one install. Uses DashMap for lock-free concurrent access.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Default: 5 attempts per 10 minutes
const DEFAULT_MAX_ATTEMPTS: usize = 5;
const DEFAULT_WINDOW_SECS: u64 = 10 * 60;

/// Sliding window rate limiter keyed by device id
pub struct RateLimiter {
    /// Map of device_id -> attempt timestamps
    attempts: DashMap<String, Vec<Instant>>,
    max_attempts: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            attempts: DashMap::new(),
            max_attempts,
            window,
        }
    }

    /// Record an attempt if the device is under its limit
    ///
    /// Returns `false` when the attempt must be refused
    pub fn check_and_record(&self, device_id: &str) -> bool {
        let now = Instant::now();
        let window = self.window;

        let mut entry = self.attempts.entry(device_id.to_string()).or_default();
        let timestamps = entry.value_mut();
        timestamps.retain(|t| now.duration_since(*t) < window);

        if timestamps.len() >= self.max_attempts {
            warn!(
                device_id,
                attempts = timestamps.len(),
                max = self.max_attempts,
                "Redemption attempts throttled"
            );
            return false;
        }

        timestamps.push(now);
        true
    }

    /// Attempts left in the current window
    pub fn remaining(&self, device_id: &str) -> usize {
        let now = Instant::now();
        let used = self
            .attempts
            .get(device_id)
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0);

        self.max_attempts.saturating_sub(used)
    }

    /// Forget a device's history, e.g. after a successful redemption
    pub fn reset(&self, device_id: &str) {
        self.attempts.remove(device_id);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Duration::from_secs(DEFAULT_WINDOW_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_blocks_over_limit() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check_and_record("device-a"));
        assert!(limiter.check_and_record("device-a"));
        assert!(!limiter.check_and_record("device-a"));
        assert_eq!(limiter.remaining("device-a"), 0);
    }

    #[test]
    fn test_limits_are_per_device() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check_and_record("device-a"));
        assert!(limiter.check_and_record("device-b"));
        assert!(!limiter.check_and_record("device-a"));
    }

    #[test]
    fn test_window_expiry() {
        let limiter = RateLimiter::new(1, Duration::from_millis(200));
        assert!(limiter.check_and_record("device-a"));
        assert!(!limiter.check_and_record("device-a"));

        sleep(Duration::from_millis(250));

        assert!(limiter.check_and_record("device-a"));
    }

    #[test]
    fn test_reset_clears_history() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check_and_record("device-a"));
        limiter.reset("device-a");
        assert_eq!(limiter.remaining("device-a"), 1);
        assert!(limiter.check_and_record("device-a"));
    }
}
