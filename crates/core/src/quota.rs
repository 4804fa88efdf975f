//! Per-address governors: a calendar-day allowance for free callers and a
//! fixed-window request ceiling for everyone.
//!
//! Both are keyed by the caller's network address, which is a coarse
//! identity: callers behind a shared NAT share an allowance.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::NaiveDate;
use serde::Serialize;

/// Free generations per address per calendar day.
pub const FREE_DAILY_LIMIT: u32 = 100;

/// Requests per address per window.
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// Rate window length in milliseconds.
pub const RATE_WINDOW_MS: i64 = 60_000;

// ---------------------------------------------------------------------------
// Daily allowance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyStatus {
    pub allowed: bool,
    pub used: u32,
    pub remaining: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy)]
struct DayCounter {
    count: u32,
    day: NaiveDate,
}

/// Calendar-day counters. A counter from an earlier day reads as zero.
#[derive(Debug)]
pub struct DailyUsageTracker {
    limit: u32,
    counters: Mutex<HashMap<String, DayCounter>>,
}

impl DailyUsageTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn check(&self, address: &str, today: NaiveDate) -> DailyStatus {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let used = counters
            .get(address)
            .filter(|c| c.day == today)
            .map_or(0, |c| c.count);
        self.status(used)
    }

    /// Count one generation against `address`.
    pub fn increment(&self, address: &str, today: NaiveDate) -> DailyStatus {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(address.to_string()).or_insert(DayCounter {
            count: 0,
            day: today,
        });
        if counter.day != today {
            *counter = DayCounter {
                count: 0,
                day: today,
            };
        }
        counter.count += 1;
        self.status(counter.count)
    }

    /// Drop counters from earlier days. Returns how many were removed.
    pub fn prune(&self, today: NaiveDate) -> usize {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let before = counters.len();
        counters.retain(|_, c| c.day == today);
        before - counters.len()
    }

    fn status(&self, used: u32) -> DailyStatus {
        DailyStatus {
            allowed: used < self.limit,
            used,
            remaining: self.limit.saturating_sub(used),
            limit: self.limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Request ceiling
// ---------------------------------------------------------------------------

/// Fixed-window request counter.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: u32,
    window_ms: i64,
    windows: Mutex<HashMap<String, (i64, u32)>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32) -> Self {
        Self::with_window(max_per_window, RATE_WINDOW_MS)
    }

    pub fn with_window(max_per_window: u32, window_ms: i64) -> Self {
        Self {
            max_per_window,
            window_ms: window_ms.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request and report whether it is within the ceiling.
    pub fn check(&self, address: &str, now_ms: i64) -> bool {
        let window = now_ms.div_euclid(self.window_ms);
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = windows.entry(address.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        entry.1 += 1;
        entry.1 <= self.max_per_window
    }

    /// Forget addresses whose window has passed.
    pub fn prune(&self, now_ms: i64) -> usize {
        let window = now_ms.div_euclid(self.window_ms);
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, (w, _)| *w == window);
        before - windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    // ---- Test: daily allowance ----

    #[test]
    fn allowance_runs_out_at_the_limit() {
        let tracker = DailyUsageTracker::new(2);
        assert!(tracker.check("1.2.3.4", day(1)).allowed);
        tracker.increment("1.2.3.4", day(1));
        let status = tracker.increment("1.2.3.4", day(1));
        assert_eq!(status.used, 2);
        assert_eq!(status.remaining, 0);
        assert!(!tracker.check("1.2.3.4", day(1)).allowed);
    }

    #[test]
    fn allowance_resets_on_a_new_day() {
        let tracker = DailyUsageTracker::new(1);
        tracker.increment("a", day(1));
        assert!(!tracker.check("a", day(1)).allowed);
        assert!(tracker.check("a", day(2)).allowed);
        assert_eq!(tracker.increment("a", day(2)).used, 1);
    }

    #[test]
    fn prune_removes_stale_days() {
        let tracker = DailyUsageTracker::new(5);
        tracker.increment("a", day(1));
        tracker.increment("b", day(2));
        assert_eq!(tracker.prune(day(2)), 1);
        assert_eq!(tracker.check("b", day(2)).used, 1);
    }

    // ---- Test: rate ceiling ----

    #[test]
    fn ceiling_applies_within_a_window() {
        let limiter = RateLimiter::with_window(3, 1_000);
        assert!(limiter.check("a", 0));
        assert!(limiter.check("a", 10));
        assert!(limiter.check("a", 20));
        assert!(!limiter.check("a", 30));
        assert!(limiter.check("b", 30));
    }

    #[test]
    fn ceiling_resets_in_the_next_window() {
        let limiter = RateLimiter::with_window(1, 1_000);
        assert!(limiter.check("a", 500));
        assert!(!limiter.check("a", 900));
        assert!(limiter.check("a", 1_000));
    }

    #[test]
    fn prune_drops_old_windows() {
        let limiter = RateLimiter::with_window(1, 1_000);
        limiter.check("a", 0);
        limiter.check("b", 1_500);
        assert_eq!(limiter.prune(1_600), 1);
    }
}
