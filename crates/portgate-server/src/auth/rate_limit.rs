//! Sliding-window limiter for failed authorization attempts.
//!
//! Only failures are recorded: a peer that keeps presenting the right key
//! is never throttled, one that guesses is locked out once it reaches the
//! limit within the window. A failure is reserved before the request runs,
//! so concurrent guesses cannot all slip past the check.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Per-key attempt counter over a rolling window.
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    /// key → timestamps of recorded attempts.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    fn cutoff(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.window)
    }

    /// Whether another attempt from `key` is still allowed.
    pub fn check(&self, key: &str) -> bool {
        let cutoff = self.cutoff(Instant::now());
        match self.entries.get(key) {
            Some(attempts) => {
                let active = attempts.iter().filter(|t| Some(**t) > cutoff).count();
                (active as u32) < self.max_attempts
            }
            None => true,
        }
    }

    /// Record an attempt from `key` if it is still allowed.
    ///
    /// Returns the recorded timestamp, or `None` when rate-limited.
    pub fn check_and_record(&mut self, key: &str) -> Option<Instant> {
        let now = Instant::now();
        let cutoff = self.cutoff(now);
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| Some(*t) > cutoff);
        if attempts.len() as u32 >= self.max_attempts {
            return None;
        }
        attempts.push(now);
        Some(now)
    }

    /// Take back one attempt recorded at `at`.
    pub fn forget(&mut self, key: &str, at: Instant) {
        if let Some(attempts) = self.entries.get_mut(key) {
            if let Some(pos) = attempts.iter().position(|t| *t == at) {
                attempts.swap_remove(pos);
            }
            if attempts.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Drop expired entries.
    pub fn gc(&mut self) {
        let cutoff = self.cutoff(Instant::now());
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| Some(*t) > cutoff);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Failed-authorization limits for the control API, keyed by peer IP.
#[derive(Debug)]
pub struct AuthLimits {
    failures: RateLimiter,
}

impl AuthLimits {
    /// Allow `per_minute` failed attempts per peer in any 60 s window.
    pub fn per_minute(per_minute: u32) -> Self {
        Self {
            failures: RateLimiter::new(per_minute, Duration::from_secs(60)),
        }
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        !self.failures.check(&ip.to_string())
    }

    /// Count a failure from `ip` ahead of time. `None` means `ip` is
    /// already over the limit.
    pub fn reserve_failure(&mut self, ip: &IpAddr) -> Option<Instant> {
        self.failures.check_and_record(&ip.to_string())
    }

    /// Return a reservation for a request that turned out not to be a
    /// failed authorization.
    pub fn release(&mut self, ip: &IpAddr, reserved: Instant) {
        self.failures.forget(&ip.to_string(), reserved);
    }

    pub fn gc(&mut self) {
        self.failures.gc();
    }
}

impl Default for AuthLimits {
    fn default() -> Self {
        Self::per_minute(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn blocks_after_limit() {
        let mut limits = AuthLimits::per_minute(3);
        let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4));
        for _ in 0..3 {
            assert!(!limits.is_blocked(&ip));
            assert!(limits.reserve_failure(&ip).is_some());
        }
        assert!(limits.is_blocked(&ip));
        assert!(limits.reserve_failure(&ip).is_none());
    }

    #[test]
    fn released_reservation_frees_the_slot() {
        let mut limits = AuthLimits::per_minute(1);
        let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4));
        let reserved = limits.reserve_failure(&ip).unwrap();
        assert!(limits.is_blocked(&ip));
        limits.release(&ip, reserved);
        assert!(!limits.is_blocked(&ip));
        assert_eq!(limits.failures.tracked_keys(), 0);
    }

    #[test]
    fn peers_are_independent() {
        let mut limits = AuthLimits::per_minute(1);
        let a = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4));
        let b = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 5));
        assert!(limits.reserve_failure(&a).is_some());
        assert!(limits.is_blocked(&a));
        assert!(!limits.is_blocked(&b));
    }

    #[test]
    fn window_expiry_unblocks_and_gc_forgets() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check_and_record("k").is_some());
        assert!(!limiter.check("k"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check("k"));
        limiter.gc();
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
