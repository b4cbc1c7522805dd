//! Per-user fixed-window request limiter.
//!
//! Each user gets a window that opens on their first request and lasts
//! `window` long. Every request inside the window bumps the counter, including
//! rejected ones, so hammering the service never reopens the window early.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Request counter for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub start: Instant,
    pub count: u32,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// Time until the current window closes.
    pub retry_after: Duration,
}

pub struct RateLimiter {
    windows: DashMap<i64, RateWindow>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// Record a request from `user_id` and decide whether it may proceed.
    pub fn admit(&self, user_id: i64, now: Instant) -> bool {
        self.check(user_id, now).allowed
    }

    pub fn check(&self, user_id: i64, now: Instant) -> Admission {
        // The entry guard holds the shard lock, so the read-modify-write below
        // is atomic for this user without blocking users on other shards.
        let mut entry = self.windows.entry(user_id).or_insert(RateWindow {
            start: now,
            count: 0,
        });
        let window = entry.value_mut();

        if window.count == 0 || now.saturating_duration_since(window.start) >= self.window {
            window.start = now;
            window.count = 1;
        } else {
            window.count = window.count.saturating_add(1);
        }

        let allowed = window.count <= self.max_requests;
        let remaining = self.max_requests.saturating_sub(window.count);
        let retry_after = self
            .window
            .saturating_sub(now.saturating_duration_since(window.start));

        if allowed {
            debug!(
                "Rate limit check for user {}: {}/{} requests",
                user_id, window.count, self.max_requests
            );
        } else {
            warn!(
                "Rate limit exceeded for user {}: {}/{} requests",
                user_id, window.count, self.max_requests
            );
        }

        Admission {
            allowed,
            remaining,
            retry_after,
        }
    }

    /// Snapshot of a user's current window, if any.
    pub fn window(&self, user_id: i64) -> Option<RateWindow> {
        self.windows.get(&user_id).map(|w| *w)
    }

    /// Drop windows that have already expired. Returns how many were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.start) < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter() -> RateLimiter {
        RateLimiter::new(5, Duration::from_secs(60))
    }

    #[test]
    fn test_first_request_always_admitted() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.window(7).is_none());
        assert!(limiter.admit(7, now));
        assert_eq!(limiter.window(7).unwrap().count, 1);
    }

    #[test]
    fn test_sixth_request_in_window_rejected() {
        let limiter = limiter();
        let now = Instant::now();
        for i in 0..5 {
            assert!(limiter.admit(1, now + Duration::from_secs(i)), "request {i}");
        }
        assert!(!limiter.admit(1, now + Duration::from_secs(10)));
    }

    #[test]
    fn test_rejections_still_count() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..8 {
            limiter.admit(1, now);
        }
        let window = limiter.window(1).unwrap();
        assert_eq!(window.count, 8);
        assert_eq!(window.start, now);
    }

    #[test]
    fn test_window_resets_exactly_at_boundary() {
        let limiter = limiter();
        let start = Instant::now();
        for _ in 0..6 {
            limiter.admit(1, start);
        }

        let just_before = start + Duration::from_secs(60) - Duration::from_millis(1);
        assert!(!limiter.admit(1, just_before));
        assert_eq!(limiter.window(1).unwrap().start, start);

        let boundary = start + Duration::from_secs(60);
        assert!(limiter.admit(1, boundary));
        let window = limiter.window(1).unwrap();
        assert_eq!(window.start, boundary);
        assert_eq!(window.count, 1);
    }

    #[test]
    fn test_allowed_never_exceeds_max_per_window() {
        let limiter = limiter();
        let start = Instant::now();
        let mut allowed_per_window = [0u32; 3];
        let mut resets = 0;
        let mut last_start = None;

        // 3 windows, one request every 2 seconds
        for step in 0..90u64 {
            let now = start + Duration::from_secs(step * 2);
            if limiter.admit(42, now) {
                allowed_per_window[(step * 2 / 60) as usize] += 1;
            }
            let window_start = limiter.window(42).unwrap().start;
            if last_start != Some(window_start) {
                resets += 1;
                last_start = Some(window_start);
            }
        }

        assert_eq!(allowed_per_window, [5, 5, 5]);
        assert_eq!(resets, 3);
    }

    #[test]
    fn test_users_are_independent() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.admit(1, now));
        }
        assert!(!limiter.admit(1, now));
        assert!(limiter.admit(2, now));
    }

    #[test]
    fn test_check_reports_remaining_and_retry_after() {
        let limiter = limiter();
        let now = Instant::now();
        let first = limiter.check(3, now);
        assert!(first.allowed);
        assert_eq!(first.remaining, 4);
        assert_eq!(first.retry_after, Duration::from_secs(60));

        let later = limiter.check(3, now + Duration::from_secs(15));
        assert_eq!(later.remaining, 3);
        assert_eq!(later.retry_after, Duration::from_secs(45));
    }

    #[test]
    fn test_prune_drops_expired_windows() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.admit(1, now);
        limiter.admit(2, now + Duration::from_secs(30));

        assert_eq!(limiter.prune(now + Duration::from_secs(61)), 1);
        assert_eq!(limiter.tracked_users(), 1);
        assert!(limiter.window(1).is_none());
    }

    #[test]
    fn test_concurrent_admission_is_exact() {
        let limiter = Arc::new(limiter());
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.admit(99, now))
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 5);
        assert_eq!(limiter.window(99).unwrap().count, 80);
    }
}
