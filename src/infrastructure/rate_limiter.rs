//! Sliding-window rate limiter (spec.md §5.3): a 60-second window of
//! timestamps per caller, admission checked by counting entries still
//! inside the window before pushing a new one. A plain retained-timestamps
//! vector matches spec.md §4.9's stated semantics exactly ("keep only
//! timestamps within the last 60s; admit iff the retained count < capacity")
//! rather than a token-bucket scheme, which would allow bursts the spec
//! doesn't.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct RateLimiter {
    window: Duration,
    capacity: usize,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `key` may proceed, recording the attempt either
    /// way would be wrong — only admitted attempts count against the
    /// window, so rejected calls don't further starve the caller.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        let entries = hits.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < self.window);
        if entries.len() >= self.capacity {
            return false;
        }
        entries.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity_then_rejects() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        assert!(limiter.check("agent"));
        assert!(limiter.check("agent"));
        assert!(limiter.check("agent"));
        assert!(!limiter.check("agent"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }
}
