//! Per-remote-address sliding-window rate limiter (§5 "Rate limiting"),
//! orthogonal to the per-rule `maxMessagesPerDay` enforced inside
//! `chat-permissions`. A plain `DashMap<IpAddr, VecDeque<Instant>>` rather
//! than a crate dependency: the window is tiny and the check is on every
//! request's hot path.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Clone)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    hits: std::sync::Arc<DashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max: u32, window_ms: u64) -> Self {
        Self {
            max,
            window: Duration::from_millis(window_ms),
            hits: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Records a hit for `addr` and returns whether it is within budget.
    pub fn check(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.hits.entry(addr).or_default();
        while entry.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            entry.pop_front();
        }
        if entry.len() as u32 >= self.max {
            return false;
        }
        entry.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_denies() {
        let limiter = RateLimiter::new(2, 60_000);
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.check(addr));
        assert!(limiter.check(addr));
        assert!(!limiter.check(addr));
    }

    #[test]
    fn distinct_addresses_have_independent_budgets() {
        let limiter = RateLimiter::new(1, 60_000);
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.check(a));
        assert!(limiter.check(b));
        assert!(!limiter.check(a));
    }
}
