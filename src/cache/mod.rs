// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dual-backend cache with cross-process invalidation.
//!
//! # Backend selection
//!
//! Each call captures `ConnectionManager::is_healthy()` once and routes on it:
//!
//! ```text
//!            healthy?
//!         ┌────┴─────┐
//!        yes         no
//!         │           │
//!   distributed    local map
//!         │
//!     set failed? ──► also write to local map (write-through fallback)
//! ```
//!
//! Reads never switch backend mid-call; a failed distributed read is a miss.
//! Nothing is reconciled when the backend recovers.
//!
//! # Invalidation
//!
//! [`Cache::invalidate_pattern`] evicts matches locally, deletes them from the
//! distributed store, then publishes `{pattern, origin}` on the invalidation
//! channel. Every other process evicts the same pattern from its local map
//! (whatever backend it is currently using) and repeats the distributed
//! delete, which is idempotent.
//!
//! # Cluster batching
//!
//! Redis Cluster serves a pipeline only when all of its keys hash to one
//! slot, so batches are split by [`Command::slot`] and the per-slot
//! pipelines run concurrently.

pub mod key;
pub mod local;

pub use key::KeySpace;
pub use local::{LocalStats, LocalStore, SweepReport};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, Command, Reply, Subscription, Topology};
use crate::clock::Clock;
use crate::config::CacheSettings;
use crate::connection::{Connection, ConnectionManager};
use crate::metrics::LatencyTimer;
use crate::monitor::PerformanceMonitor;

/// Keys per `DEL` pipeline when deleting scan results.
const DELETE_BATCH: usize = 100;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Malformed logical key. The only error a cache read or write returns.
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
    #[error("Cache value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Distributed,
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Distributed => write!(f, "distributed"),
            Self::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_keys: usize,
    pub memory_estimate: u64,
    pub backend_kind: BackendKind,
    pub hits: u64,
    pub misses: u64,
    /// Local entries removed by expiry or by the cap
    pub evictions: u64,
    pub local_entries: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct InvalidationMessage {
    pattern: String,
    origin: String,
}

struct CacheInner {
    connection: ConnectionManager,
    monitor: Arc<PerformanceMonitor>,
    keys: KeySpace,
    local: LocalStore,
    settings: CacheSettings,
    /// Identifies this process's own invalidation broadcasts
    origin: String,
    hits: AtomicU64,
    misses: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cache service handle. Cloning is cheap.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    pub fn new(
        connection: ConnectionManager,
        monitor: Arc<PerformanceMonitor>,
        settings: CacheSettings,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                connection,
                monitor,
                keys: KeySpace::new(&settings.namespace),
                local: LocalStore::new(clock, settings.max_local_entries),
                origin: uuid::Uuid::new_v4().to_string(),
                settings,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn key_space(&self) -> &KeySpace {
        &self.inner.keys
    }

    #[must_use]
    pub fn local(&self) -> &LocalStore {
        &self.inner.local
    }

    /// Start the local sweep and the invalidation subscriber.
    ///
    /// The first subscription attempt completes before this returns, so
    /// broadcasts sent right after startup are not missed.
    #[tracing::instrument(skip(self), fields(namespace = %self.inner.settings.namespace))]
    pub async fn start(&self) {
        let sweep = {
            let weak = Arc::downgrade(&self.inner);
            let period = self.inner.settings.sweep_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    inner.sweep();
                }
            })
        };

        let initial = self.inner.subscribe().await;
        let listener = tokio::spawn(run_invalidation_listener(Arc::downgrade(&self.inner), initial));

        let mut tasks = self.inner.tasks.lock();
        tasks.push(sweep);
        tasks.push(listener);
        info!("Cache background tasks started");
    }

    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Store `value` under `key` for `ttl` (configured default when `None`).
    pub async fn set(&self, key: &str, value: impl Into<Vec<u8>>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let physical = self.inner.keys.key(key)?;
        let ttl = self.inner.ttl(ttl);
        let value = value.into();

        if !self.inner.connection.is_healthy() {
            self.inner.local.set(physical, value, ttl);
            crate::metrics::record_operation("cache", "set", "local");
            return Ok(());
        }

        let command = Command::SetEx { key: physical.clone(), value: value.clone(), ttl };
        match self.inner.execute_one(command).await {
            Ok(_) => {
                crate::metrics::record_operation("cache", "set", "success");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Distributed cache write failed; keeping value locally");
                crate::metrics::record_cache_fallback("set");
                self.inner.local.set(physical, value, ttl);
            }
        }
        Ok(())
    }

    /// Value for `key`, or `None` when absent or expired.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let physical = self.inner.keys.key(key)?;

        if !self.inner.connection.is_healthy() {
            let value = self.inner.local.get(&physical);
            crate::metrics::record_cache_access("local", value.is_some());
            return Ok(value);
        }

        let value = match self.inner.execute_one(Command::Get { key: physical }).await {
            Ok(reply) => reply.into_bytes().unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "Unexpected cache reply");
                None
            }),
            Err(e) => {
                warn!(key = %key, error = %e, "Distributed cache read failed; treating as miss");
                None
            }
        };
        self.inner.count_access(value.is_some());
        Ok(value)
    }

    /// Remove `key` from both backends. True if either held it.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let physical = self.inner.keys.key(key)?;
        let mut removed = self.inner.local.delete(&physical);

        if self.inner.connection.is_healthy() {
            match self.inner.execute_one(Command::Del { key: physical }).await {
                Ok(reply) => removed |= reply.is_success(),
                Err(e) => warn!(key = %key, error = %e, "Distributed cache delete failed"),
            }
        }
        Ok(removed)
    }

    /// Values for `keys`, in the same order.
    pub async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let physical = keys
            .iter()
            .map(|k| self.inner.keys.key(k))
            .collect::<Result<Vec<_>, _>>()?;

        if !self.inner.connection.is_healthy() {
            return Ok(physical
                .iter()
                .map(|k| {
                    let value = self.inner.local.get(k);
                    crate::metrics::record_cache_access("local", value.is_some());
                    value
                })
                .collect());
        }

        let commands = physical.into_iter().map(|key| Command::Get { key }).collect();
        let values = self
            .inner
            .execute_routed(commands)
            .await
            .into_iter()
            .map(|result| {
                let value = match result.and_then(Reply::into_bytes) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(error = %e, "Distributed cache batch read failed; treating as miss");
                        None
                    }
                };
                self.inner.count_access(value.is_some());
                value
            })
            .collect();
        Ok(values)
    }

    /// Store several entries with one TTL in a single batch per node.
    pub async fn mset(&self, entries: &[(&str, Vec<u8>)], ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = self.inner.ttl(ttl);
        let physical = entries
            .iter()
            .map(|(k, v)| Ok((self.inner.keys.key(k)?, v.clone())))
            .collect::<Result<Vec<_>, CacheError>>()?;

        if !self.inner.connection.is_healthy() {
            for (key, value) in physical {
                self.inner.local.set(key, value, ttl);
            }
            return Ok(());
        }

        let commands = physical
            .iter()
            .map(|(key, value)| Command::SetEx { key: key.clone(), value: value.clone(), ttl })
            .collect();
        let results = self.inner.execute_routed(commands).await;
        let mut fell_back = 0usize;
        for ((key, value), result) in physical.into_iter().zip(results) {
            if result.is_err() {
                self.inner.local.set(key, value, ttl);
                fell_back += 1;
            }
        }
        if fell_back > 0 {
            warn!(entries = fell_back, "Distributed batch write failed; kept entries locally");
            crate::metrics::record_cache_fallback("mset");
        }
        Ok(())
    }

    /// Remove every key matching the logical glob, here and in every process
    /// listening on the invalidation channel. Returns keys removed locally
    /// plus keys removed from the distributed store.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let physical = self.inner.keys.pattern(pattern)?;
        let mut removed = self.inner.local.invalidate(&physical);

        if self.inner.connection.is_healthy() {
            match self.inner.delete_matching(&physical).await {
                Ok(deleted) => removed += deleted,
                Err(e) => warn!(pattern = %pattern, error = %e, "Distributed invalidation failed"),
            }
            self.inner.broadcast(&physical).await;
        }

        debug!(pattern = %pattern, removed, "Pattern invalidated");
        crate::metrics::record_invalidation("local", removed);
        Ok(removed)
    }

    /// Drop every entry in this cache's namespace.
    pub async fn clear(&self) {
        self.inner.local.clear();
        if self.inner.connection.is_healthy() {
            let all = self.inner.keys.all();
            if let Err(e) = self.inner.delete_matching(&all).await {
                warn!(error = %e, "Distributed cache clear failed");
            }
        }
    }

    pub async fn get_stats(&self) -> CacheStats {
        let local = self.inner.local.stats();
        let hits = self.inner.hits.load(Ordering::Relaxed) + local.hits;
        let misses = self.inner.misses.load(Ordering::Relaxed) + local.misses;
        let local_only = CacheStats {
            total_keys: local.entries,
            memory_estimate: local.bytes as u64,
            backend_kind: BackendKind::Local,
            hits,
            misses,
            evictions: local.expired + local.evicted,
            local_entries: local.entries,
        };

        if !self.inner.connection.is_healthy() {
            return local_only;
        }
        match self.inner.distributed_usage().await {
            Ok((total_keys, memory_estimate)) => CacheStats {
                total_keys,
                memory_estimate,
                backend_kind: BackendKind::Distributed,
                ..local_only
            },
            Err(e) => {
                warn!(error = %e, "Could not read distributed cache stats");
                local_only
            }
        }
    }

    /// Cache-aside: return the cached value, or run `loader`, store its
    /// result for `ttl` and return it.
    pub async fn get_or_set<F, Fut, E>(&self, key: &str, ttl: Option<Duration>, loader: F) -> Result<Vec<u8>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: From<CacheError>,
    {
        if let Some(hit) = self.get(key).await? {
            return Ok(hit);
        }
        let value = loader().await?;
        self.set(key, value.clone(), ttl).await?;
        Ok(value)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl CacheInner {
    fn ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.filter(|t| !t.is_zero()).unwrap_or_else(|| self.settings.default_ttl())
    }

    fn count_access(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        crate::metrics::record_cache_access("distributed", hit);
    }

    fn connection(&self) -> Result<Connection, BackendError> {
        Ok(self.connection.get_connection()?)
    }

    async fn execute_one(&self, command: Command) -> Result<Reply, BackendError> {
        let _timer = LatencyTimer::new("cache", command.name());
        let operation = format!("cache.{}", command.name());
        self.monitor
            .measure(&operation, async {
                match self.connection() {
                    Ok(conn) => conn.execute_one(command).await,
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Execute one pipeline per hash slot (cluster) or a single pipeline.
    /// Results line up with `commands`.
    async fn execute_routed(&self, commands: Vec<Command>) -> Vec<Result<Reply, BackendError>> {
        if commands.is_empty() {
            return Vec::new();
        }
        let total = commands.len();
        let conn = match self.connection() {
            Ok(conn) => conn,
            Err(e) => return (0..total).map(|_| Err(e.clone())).collect(),
        };

        let _timer = LatencyTimer::new("cache", "pipeline");
        let groups = group_by_slot(conn.topology(), commands);
        let batches = groups.into_iter().map(|group| {
            let conn = conn.clone();
            async move {
                let (indices, batch): (Vec<usize>, Vec<Command>) = group.into_iter().unzip();
                let result = self.monitor.measure("cache.pipeline", conn.execute(batch)).await;
                (indices, result)
            }
        });

        let mut out: Vec<Result<Reply, BackendError>> = (0..total).map(|_| Ok(Reply::Nil)).collect();
        for (indices, result) in join_all(batches).await {
            match result {
                Ok(replies) => {
                    for (i, reply) in indices.into_iter().zip(replies) {
                        out[i] = Ok(reply);
                    }
                }
                Err(e) => {
                    for i in indices {
                        out[i] = Err(e.clone());
                    }
                }
            }
        }
        out
    }

    /// Delete every key matching `pattern`. Fails only if nothing could be
    /// deleted; partial failures are logged.
    async fn delete_matching(&self, pattern: &str) -> Result<usize, BackendError> {
        let keys = self.connection()?.scan(pattern).await?;
        let mut deleted = 0usize;
        let mut failure = None;
        for chunk in keys.chunks(DELETE_BATCH) {
            let commands = chunk.iter().map(|key| Command::Del { key: key.clone() }).collect();
            for result in self.execute_routed(commands).await {
                match result {
                    Ok(reply) if reply.is_success() => deleted += 1,
                    Ok(_) => {}
                    Err(e) => failure = Some(e),
                }
            }
        }
        match failure {
            Some(e) if deleted == 0 => Err(e),
            Some(e) => {
                warn!(pattern = %pattern, deleted, error = %e, "Some matching keys could not be deleted");
                Ok(deleted)
            }
            None => Ok(deleted),
        }
    }

    async fn broadcast(&self, pattern: &str) {
        let message = InvalidationMessage {
            pattern: pattern.to_string(),
            origin: self.origin.clone(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Could not encode invalidation message");
                return;
            }
        };
        let command = Command::Publish {
            channel: self.settings.invalidation_channel.clone(),
            message: payload,
        };
        if let Err(e) = self.execute_one(command).await {
            warn!(pattern = %pattern, error = %e, "Failed to publish invalidation");
        }
    }

    async fn subscribe(&self) -> Option<Subscription> {
        let channel = &self.settings.invalidation_channel;
        let result = match self.connection() {
            Ok(conn) => conn.subscribe(channel).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(subscription) => {
                info!(channel = %channel, "Subscribed to cache invalidations");
                Some(subscription)
            }
            Err(e) => {
                debug!(channel = %channel, error = %e, "Invalidation subscription unavailable");
                None
            }
        }
    }

    async fn handle_invalidation(&self, payload: &str) {
        let message: InvalidationMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed invalidation message");
                return;
            }
        };
        if message.origin == self.origin {
            return;
        }

        // Evict locally no matter which backend this process is using
        let mut removed = self.local.invalidate(&message.pattern);
        if self.connection.is_healthy() {
            match self.delete_matching(&message.pattern).await {
                Ok(deleted) => removed += deleted,
                Err(e) => debug!(error = %e, "Best-effort distributed invalidation failed"),
            }
        }
        debug!(pattern = %message.pattern, removed, "Applied remote invalidation");
        crate::metrics::record_invalidation("remote", removed);
    }

    fn sweep(&self) {
        let report = self.local.sweep();
        if report.evicted > 0 {
            warn!(
                evicted = report.evicted,
                cap = self.local.max_entries(),
                "Local cache over capacity; evicted soonest-expiring entries"
            );
        }
        crate::metrics::record_local_eviction(report.expired, report.evicted);
        crate::metrics::set_local_cache_items(self.local.len());
    }

    async fn distributed_usage(&self) -> Result<(usize, u64), BackendError> {
        let conn = self.connection()?;
        let total_keys = conn.scan(&self.keys.all()).await?.len();
        let memory = conn.memory_bytes().await?.unwrap_or(0);
        Ok((total_keys, memory))
    }
}

/// Split a batch into pipelines the topology can serve, keeping each
/// command's original index. Outside a cluster this is one group.
fn group_by_slot(topology: Topology, commands: Vec<Command>) -> Vec<Vec<(usize, Command)>> {
    if topology != Topology::Cluster {
        return vec![commands.into_iter().enumerate().collect()];
    }
    let mut groups: BTreeMap<Option<u16>, Vec<(usize, Command)>> = BTreeMap::new();
    for (i, command) in commands.into_iter().enumerate() {
        groups.entry(command.slot()).or_default().push((i, command));
    }
    groups.into_values().collect()
}

async fn run_invalidation_listener(weak: Weak<CacheInner>, mut current: Option<Subscription>) {
    loop {
        if let Some(mut subscription) = current.take() {
            while let Some(payload) = subscription.next_message().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.handle_invalidation(&payload).await;
            }
            warn!(channel = %subscription.channel(), "Invalidation subscription ended; resubscribing");
        }

        let delay = match weak.upgrade() {
            Some(inner) => inner.settings.resubscribe_delay(),
            None => return,
        };
        sleep(delay).await;
        let Some(inner) = weak.upgrade() else { return };
        current = inner.subscribe().await;
    }
}

/// Stable hex digest of query parameters, for list-result cache keys.
pub fn fingerprint<T: Serialize + ?Sized>(params: &T) -> Result<String, CacheError> {
    let canonical = serde_json::to_vec(params)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// `<entity>:list:<fingerprint>`; pair with `invalidate_pattern("<entity>:list:*")`.
pub fn list_key<T: Serialize + ?Sized>(entity: &str, params: &T) -> Result<String, CacheError> {
    Ok(format!("{}:list:{}", entity, fingerprint(params)?))
}
