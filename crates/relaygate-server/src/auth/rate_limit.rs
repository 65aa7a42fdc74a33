//! Sliding-window rate limiter for tunnel connect attempts.
//!
//! Each key keeps the timestamps of its recent attempts; timestamps older
//! than the window are dropped before every check.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with configurable per-key limits and window duration.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-key tracking: key → list of attempt timestamps.
    entries: HashMap<IpAddr, Vec<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// * `max_attempts` - Maximum allowed attempts within the window.
    /// * `window` - Window duration.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Check if an attempt is allowed for the given key, and record it if so.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, key: IpAddr) -> bool {
        self.check_and_record_at(key, Instant::now())
    }

    pub fn check_and_record_at(&mut self, key: IpAddr, now: Instant) -> bool {
        let window = self.window;
        let attempts = self.entries.entry(key).or_default();

        // Remove expired entries
        attempts.retain(|t| now.saturating_duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&mut self) {
        self.gc_at(Instant::now());
    }

    pub fn gc_at(&mut self, now: Instant) {
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.saturating_duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

/// Connect attempts per remote IP, default 5 per minute.
pub fn connect_limiter(max_attempts: u32) -> RateLimiter {
    RateLimiter::new(max_attempts, Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn blocks_after_limit_within_window() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_and_record_at(A, now));
        assert!(limiter.check_and_record_at(A, now));
        assert!(limiter.check_and_record_at(A, now));
        assert!(!limiter.check_and_record_at(A, now));
        // other keys are independent
        assert!(limiter.check_and_record_at(B, now));
    }

    #[test]
    fn window_slides() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_and_record_at(A, now));
        assert!(!limiter.check_and_record_at(A, now + Duration::from_secs(59)));
        assert!(limiter.check_and_record_at(A, now + Duration::from_secs(61)));
    }

    #[test]
    fn gc_drops_idle_keys() {
        let mut limiter = connect_limiter(5);
        let now = Instant::now();
        limiter.check_and_record_at(A, now);
        limiter.check_and_record_at(B, now + Duration::from_secs(30));
        limiter.gc_at(now + Duration::from_secs(70));
        assert_eq!(limiter.tracked(), 1);
    }
}
