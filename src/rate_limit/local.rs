// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process window counters used while the backend is unhealthy.
//!
//! Same contract as the backend's window script: increment, start the expiry
//! on the first hit, report count and remaining milliseconds. Each process
//! enforces its own limit in this mode.

use dashmap::DashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: u64,
    expires_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct LocalWindows {
    windows: DashMap<String, LocalWindow>,
}

impl LocalWindows {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one hit on `key` at `now_ms`. Returns `(count, remaining_ms)`.
    pub fn incr(&self, key: &str, ttl: Duration, now_ms: u64) -> (u64, u64) {
        let fresh = LocalWindow {
            count: 0,
            expires_at_ms: now_ms + ttl.as_millis() as u64,
        };
        let mut window = self.windows.entry(key.to_string()).or_insert(fresh);
        if window.expires_at_ms <= now_ms {
            *window = fresh;
        }
        window.count += 1;
        (window.count, window.expires_at_ms - now_ms)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.windows.remove(key).is_some()
    }

    /// Drop expired windows. Returns how many.
    pub fn cleanup(&self, now_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| w.expires_at_ms > now_ms);
        before.saturating_sub(self.windows.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
