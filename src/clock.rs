// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wall-clock milliseconds driven by the tokio clock.
//!
//! TTLs, rate windows and lock expiry all need an epoch timestamp, but tests
//! need to move time forward without sleeping. [`Clock`] anchors an epoch
//! reading to a `tokio::time::Instant` once, and derives every later reading
//! from elapsed tokio time. Under `#[tokio::test(start_paused = true)]` the
//! whole crate therefore runs on simulated time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_epoch_ms: u64,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        let origin_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::starting_at(origin_epoch_ms)
    }

    /// Clock whose current reading is exactly `epoch_ms`.
    #[must_use]
    pub fn starting_at(epoch_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            origin_epoch_ms: epoch_ms,
        }
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.origin_epoch_ms + self.origin.elapsed().as_millis() as u64
    }

    /// Epoch milliseconds `ttl` from now.
    #[must_use]
    pub fn deadline(&self, ttl: Duration) -> u64 {
        self.now_ms().saturating_add(ttl.as_millis() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
