//! Sliding-window rate limiting keyed by client network identity.
//!
//! Each key keeps the timestamps of its requests inside the trailing window;
//! stale timestamps are pruned whenever that key is touched again. State is
//! per-process and scoped to the proxy endpoint only.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Returned when a key is over its cap. `retry_after_secs` is the window
/// length, the soonest moment the whole window can have rolled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateExceeded {
    pub retry_after_secs: u64,
}

pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: usize,
    hits: DashMap<String, Vec<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            hits: DashMap::new(),
        }
    }

    /// Record one request for `key`, or reject it if the key already used up
    /// its budget within the trailing window.
    pub fn check(&self, key: &str) -> Result<(), RateExceeded> {
        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.max_requests {
            return Err(RateExceeded {
                retry_after_secs: self.retry_after_secs(),
            });
        }
        entry.push(now);
        Ok(())
    }

    pub fn retry_after_secs(&self) -> u64 {
        (self.window.as_secs_f64().ceil() as u64).max(1)
    }
}
