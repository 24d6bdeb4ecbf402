// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fixed-window rate limiting per `(route, identifier)`.
//!
//! The current window is `now / window_ms`; its counter lives at
//! `<prefix>:<route>:<identifier>:<window>`. One backend round trip
//! increments it, starts its expiry on the first hit and reads the remaining
//! TTL. A client can burst up to twice the limit across a window boundary.
//!
//! | Backend state            | Behaviour                                   |
//! |--------------------------|---------------------------------------------|
//! | healthy                  | shared counter in the backend               |
//! | unhealthy                | per-process counter in [`LocalWindows`]     |
//! | healthy but call fails   | request allowed (fail open), logged         |

pub mod identity;
pub mod local;

pub use identity::{KeyStrategy, RequestIdentity};
pub use local::LocalWindows;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::backend::{BackendError, Command, Reply};
use crate::clock::Clock;
use crate::config::RateLimitSettings;
use crate::connection::ConnectionManager;
use crate::monitor::PerformanceMonitor;

/// Per-route policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitOptions {
    pub limit: u64,
    #[serde(with = "window_millis", rename = "window_ms")]
    pub window: Duration,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
}

impl RateLimitOptions {
    #[must_use]
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            key_strategy: KeyStrategy::Ip,
        }
    }

    #[must_use]
    pub fn with_key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    fn window_ms(&self) -> u64 {
        (self.window.as_millis() as u64).max(1)
    }
}

mod window_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub current: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the window's counter expires
    pub reset_at: u64,
    /// Present iff the request was rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitResult {
    fn from_count(limit: u64, count: u64, now_ms: u64, remaining_ms: u64) -> Self {
        let allowed = count <= limit;
        Self {
            allowed,
            limit,
            current: count,
            remaining: limit.saturating_sub(count),
            reset_at: now_ms + remaining_ms,
            retry_after_seconds: (!allowed).then(|| remaining_ms.div_ceil(1000).max(1)),
        }
    }

    fn fail_open(limit: u64, now_ms: u64, window_ms: u64) -> Self {
        Self {
            allowed: true,
            limit,
            current: 0,
            remaining: limit,
            reset_at: now_ms + window_ms,
            retry_after_seconds: None,
        }
    }

    /// Response headers for the HTTP layer.
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.div_ceil(1000).to_string()),
        ];
        if let Some(retry) = self.retry_after_seconds {
            headers.push(("Retry-After", retry.to_string()));
        }
        headers
    }
}

struct Inner {
    connection: ConnectionManager,
    monitor: Arc<PerformanceMonitor>,
    prefix: String,
    defaults: RateLimitOptions,
    local: LocalWindows,
    clock: Clock,
    cleanup_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(
        connection: ConnectionManager,
        monitor: Arc<PerformanceMonitor>,
        settings: &RateLimitSettings,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                monitor,
                prefix: settings.prefix.clone(),
                defaults: RateLimitOptions::new(settings.default_limit, settings.default_window()),
                local: LocalWindows::new(),
                clock,
                cleanup_interval: settings.cleanup_interval(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Policy used when a route has none of its own.
    #[must_use]
    pub fn default_options(&self) -> &RateLimitOptions {
        &self.inner.defaults
    }

    /// Start the periodic sweep of expired local windows.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let removed = inner.local.cleanup(inner.clock.now_ms());
                if removed > 0 {
                    debug!(removed, remaining = inner.local.len(), "Expired local rate windows dropped");
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn window_key(&self, route: &str, identifier: &str, window_index: u64) -> String {
        format!("{}:{}:{}:{}", self.inner.prefix, route, identifier, window_index)
    }

    /// Count one request from `identifier` on `route`. Never rejects because
    /// of a coordination failure.
    pub async fn check_rate_limit(&self, route: &str, options: &RateLimitOptions, identifier: &str) -> RateLimitResult {
        let now = self.inner.clock.now_ms();
        let window_ms = options.window_ms();
        let key = self.window_key(route, identifier, now / window_ms);
        // Counter TTL is whole seconds, rounded up
        let ttl = Duration::from_secs(window_ms.div_ceil(1000));

        let (result, backend) = if self.inner.connection.is_healthy() {
            match self.inner.monitor.measure("rate_limit.check", self.distributed_incr(&key, ttl)).await {
                Ok((count, remaining_ms)) => {
                    (RateLimitResult::from_count(options.limit, count, now, remaining_ms), "distributed")
                }
                Err(e) => {
                    warn!(route = %route, identifier = %identifier, error = %e, "Rate limit check failed; allowing request");
                    crate::metrics::record_rate_limit_decision(route, "distributed", "fail_open");
                    return RateLimitResult::fail_open(options.limit, now, window_ms);
                }
            }
        } else {
            let (count, remaining_ms) = self.inner.local.incr(&key, ttl, now);
            (RateLimitResult::from_count(options.limit, count, now, remaining_ms), "local")
        };

        let decision = if result.allowed { "allowed" } else { "denied" };
        if !result.allowed {
            debug!(route = %route, identifier = %identifier, current = result.current, limit = result.limit, "Rate limit exceeded");
        }
        crate::metrics::record_rate_limit_decision(route, backend, decision);
        result
    }

    /// [`check_rate_limit`](Self::check_rate_limit) with the identifier taken
    /// from the request under the route's key strategy.
    pub async fn check_request(&self, route: &str, options: &RateLimitOptions, request: &RequestIdentity) -> RateLimitResult {
        let identifier = request.identifier(options.key_strategy);
        self.check_rate_limit(route, options, &identifier).await
    }

    /// Forget the current window for `(route, identifier)` in both backends.
    pub async fn reset(&self, route: &str, options: &RateLimitOptions, identifier: &str) {
        let key = self.window_key(route, identifier, self.inner.clock.now_ms() / options.window_ms());
        self.inner.local.remove(&key);
        if !self.inner.connection.is_healthy() {
            return;
        }
        let result = self
            .inner
            .monitor
            .measure("rate_limit.reset", async {
                match self.inner.connection.get_connection() {
                    Ok(conn) => conn.execute_one(Command::Del { key }).await.map(|_| ()),
                    Err(e) => Err(BackendError::from(e)),
                }
            })
            .await;
        if let Err(e) = result {
            warn!(route = %route, identifier = %identifier, error = %e, "Failed to reset rate limit window");
        }
    }

    async fn distributed_incr(&self, key: &str, ttl: Duration) -> Result<(u64, u64), BackendError> {
        let conn = self.inner.connection.get_connection()?;
        let reply = conn
            .execute_one(Command::WindowIncr { key: key.to_string(), ttl })
            .await?;
        parse_window_reply(reply, ttl)
    }
}

/// `[count, pttl]`; a missing or negative TTL counts as a full window.
fn parse_window_reply(reply: Reply, ttl: Duration) -> Result<(u64, u64), BackendError> {
    let parts = match reply {
        Reply::Array(parts) => parts,
        other => return Err(BackendError::Protocol(format!("window counter reply: {:?}", other))),
    };
    let count = parts
        .first()
        .ok_or_else(|| BackendError::Protocol("window counter reply missing count".into()))?
        .as_int()?;
    let remaining = match parts.get(1).map(Reply::as_int).transpose()? {
        Some(ms) if ms >= 0 => ms as u64,
        _ => ttl.as_millis() as u64,
    };
    Ok((count.max(0) as u64, remaining))
}
