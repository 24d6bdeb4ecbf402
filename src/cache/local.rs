// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local fallback store.
//!
//! A `DashMap` of physical key to `(value, expires_at)`. Expired entries are
//! dropped lazily on read and in bulk by [`LocalStore::sweep`], which also
//! enforces the entry cap by evicting the entries that would expire soonest
//! (expiry order, not LRU).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::clock::Clock;
use crate::pattern::glob_match;

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Vec<u8>,
    expires_at_ms: u64,
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evicted: u64,
}

pub struct LocalStore {
    entries: DashMap<String, LocalEntry>,
    clock: Clock,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

impl LocalStore {
    #[must_use]
    pub fn new(clock: Clock, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now_ms();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at_ms > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            drop(entry); // Release read lock before removing
            if self.entries.remove_if(key, |_, e| e.expires_at_ms <= now).is_some() {
                self.expired.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, key: String, value: Vec<u8>, ttl: Duration) {
        let expires_at_ms = self.clock.deadline(ttl);
        self.entries.insert(key, LocalEntry { value, expires_at_ms });
    }

    /// Remove `key`; true if a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.entries.remove(key).is_some_and(|(_, e)| e.expires_at_ms > now)
    }

    /// Remove every entry whose key matches the glob. Returns how many.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !glob_match(pattern, key));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Entry count including not-yet-swept expired entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Drop expired entries, then evict soonest-to-expire entries until the
    /// map is within its cap.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at_ms > now);
        let expired = before.saturating_sub(self.entries.len());

        let mut evicted = 0;
        let len = self.entries.len();
        if len > self.max_entries {
            let mut by_expiry: Vec<(u64, String)> = self
                .entries
                .iter()
                .map(|e| (e.expires_at_ms, e.key().clone()))
                .collect();
            by_expiry.sort_unstable();
            for (_, key) in by_expiry.into_iter().take(len - self.max_entries) {
                if self.entries.remove(&key).is_some() {
                    evicted += 1;
                }
            }
        }

        self.expired.fetch_add(expired as u64, Ordering::Relaxed);
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        SweepReport { expired, evicted }
    }

    #[must_use]
    pub fn stats(&self) -> LocalStats {
        LocalStats {
            entries: self.entries.len(),
            bytes: self.entries.iter().map(|e| e.key().len() + e.value.len()).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}
