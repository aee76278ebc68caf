//! Per-Connection Rate Limiter
//!
//! Fixed-window counter keyed by connection id. The window is fixed, not
//! sliding: a burst straddling a window boundary can admit close to twice
//! the nominal rate. That is the documented contract (clients see stable
//! reset times) and tests pin it; do not "fix" it to a sliding window.

use crate::config::RateLimitConfig;
use crate::ConnectionId;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Fixed-window per-key rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<ConnectionId, Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Check and count one request for `key`.
    ///
    /// Returns `true` (and does not count the request) when the key is at
    /// its limit for the current window. Window state is created lazily on
    /// first use and reset once the window has elapsed.
    pub fn is_rate_limited(&self, key: ConnectionId) -> bool {
        let mut entry = self.windows.entry(key).or_insert_with(|| Window {
            started_at: Instant::now(),
            count: 0,
        });

        if entry.started_at.elapsed() >= self.config.window {
            entry.started_at = Instant::now();
            entry.count = 0;
        }

        if entry.count >= self.config.max_requests {
            return true;
        }

        entry.count += 1;
        false
    }

    /// Requests left in the current window for `key`
    pub fn remaining(&self, key: ConnectionId) -> u32 {
        match self.windows.get(&key) {
            Some(w) if w.started_at.elapsed() < self.config.window => {
                self.config.max_requests.saturating_sub(w.count)
            }
            _ => self.config.max_requests,
        }
    }

    /// Time until the current window resets for `key`
    pub fn reset_time(&self, key: ConnectionId) -> Duration {
        match self.windows.get(&key) {
            Some(w) => self.config.window.saturating_sub(w.started_at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Evict window state for a key; call on disconnect to bound memory
    pub fn remove_key(&self, key: ConnectionId) {
        self.windows.remove(&key);
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
