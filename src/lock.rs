// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lease-based mutual exclusion over named resources.
//!
//! `acquire` is `SET <prefix>:<resource> <token> NX PX <ttl>`; `release` and
//! `extend` are server-side compare-and-act scripts keyed on the token, so a
//! holder whose lease already expired can never remove someone else's lock.
//!
//! There is no quorum: this is best-effort deduplication of work, and it
//! prefers availability. Backend failures read as "not acquired" / "not
//! released" and are logged, never raised.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{BackendError, Command, Reply};
use crate::config::LockSettings;
use crate::connection::ConnectionManager;
use crate::monitor::PerformanceMonitor;

#[derive(Clone)]
pub struct DistributedLock {
    connection: ConnectionManager,
    monitor: Arc<PerformanceMonitor>,
    prefix: String,
    default_ttl: Duration,
}

impl DistributedLock {
    pub fn new(connection: ConnectionManager, monitor: Arc<PerformanceMonitor>, settings: &LockSettings) -> Self {
        Self {
            connection,
            monitor,
            prefix: settings.prefix.clone(),
            default_ttl: settings.default_ttl(),
        }
    }

    fn key(&self, resource: &str) -> String {
        format!("{}:{}", self.prefix, resource)
    }

    /// One backend round trip, recorded as `lock.<operation>`.
    async fn run(&self, operation: &str, command: Command) -> Result<Reply, BackendError> {
        let name = format!("lock.{}", operation);
        self.monitor
            .measure(&name, async {
                match self.connection.get_connection() {
                    Ok(conn) => conn.execute_one(command).await,
                    Err(e) => Err(BackendError::from(e)),
                }
            })
            .await
    }

    /// Try once to take `resource` for `ttl` (default when `None`).
    /// Returns the ownership token, or `None` if the lock is held or the
    /// backend is unavailable.
    pub async fn acquire(&self, resource: &str, ttl: Option<Duration>) -> Option<String> {
        let token = uuid::Uuid::new_v4().to_string();
        let command = Command::SetNx {
            key: self.key(resource),
            value: token.clone().into_bytes(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        match self.run("acquire", command).await {
            Ok(reply) if reply.is_success() => {
                debug!(resource = %resource, "Lock acquired");
                crate::metrics::record_lock_operation("acquire", "acquired");
                Some(token)
            }
            Ok(_) => {
                crate::metrics::record_lock_operation("acquire", "held");
                None
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Lock acquire failed; treating as not acquired");
                crate::metrics::record_lock_operation("acquire", "error");
                None
            }
        }
    }

    /// Release `resource` if `token` still owns it.
    pub async fn release(&self, resource: &str, token: &str) -> bool {
        let command = Command::DeleteIfEquals {
            key: self.key(resource),
            value: token.as_bytes().to_vec(),
        };
        match self.run("release", command).await {
            Ok(reply) => {
                let released = reply.is_success();
                if !released {
                    debug!(resource = %resource, "Lock not held by this token");
                }
                crate::metrics::record_lock_operation("release", if released { "released" } else { "not_owner" });
                released
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Lock release failed");
                crate::metrics::record_lock_operation("release", "error");
                false
            }
        }
    }

    /// Restart the lease at `ttl` if `token` still owns `resource`.
    pub async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> bool {
        let command = Command::ExpireIfEquals {
            key: self.key(resource),
            value: token.as_bytes().to_vec(),
            ttl,
        };
        match self.run("extend", command).await {
            Ok(reply) => {
                let extended = reply.is_success();
                crate::metrics::record_lock_operation("extend", if extended { "extended" } else { "not_owner" });
                extended
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Lock extend failed");
                crate::metrics::record_lock_operation("extend", "error");
                false
            }
        }
    }

    /// Run `work` only if the lock is taken; release afterwards.
    /// `None` means someone else holds it (or the backend is down).
    pub async fn with_lock<F, T>(&self, resource: &str, ttl: Option<Duration>, work: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let token = self.acquire(resource, ttl).await?;
        let output = work.await;
        self.release(resource, &token).await;
        Some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::config::CoordinationConfig;

    async fn lock_on(store: &MemoryBackend) -> DistributedLock {
        let config = CoordinationConfig::default();
        let connection = ConnectionManager::new(Arc::new(store.clone()), &config);
        connection.initialize().await;
        let monitor = Arc::new(PerformanceMonitor::new(&config.monitor));
        DistributedLock::new(connection, monitor, &config.lock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_acquirer_wins() {
        let store = MemoryBackend::new();
        let a = lock_on(&store.peer()).await;
        let b = lock_on(&store.peer()).await;

        let (ta, tb) = tokio::join!(a.acquire("R", None), b.acquire("R", None));
        assert!(ta.is_some() ^ tb.is_some());
        let (winner, token) = match (ta, tb) {
            (Some(t), None) => (&a, t),
            (None, Some(t)) => (&b, t),
            _ => unreachable!(),
        };

        assert!(!winner.release("R", "not-the-token").await);
        assert!(winner.release("R", &token).await);
        assert!(!winner.release("R", &token).await);
        assert!(a.acquire("R", None).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires() {
        let store = MemoryBackend::new();
        let lock = lock_on(&store).await;
        let stale = lock.acquire("job:7", Some(Duration::from_millis(500))).await.unwrap();
        assert!(lock.acquire("job:7", None).await.is_none());

        tokio::time::advance(Duration::from_millis(501)).await;
        let fresh = lock.acquire("job:7", None).await.unwrap();
        // Old holder cannot release the new lease
        assert!(!lock.release("job:7", &stale).await);
        assert!(lock.release("job:7", &fresh).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_requires_ownership() {
        let store = MemoryBackend::new();
        let lock = lock_on(&store).await;
        let token = lock.acquire("r", Some(Duration::from_secs(1))).await.unwrap();

        assert!(!lock.extend("r", "other", Duration::from_secs(10)).await);
        assert!(lock.extend("r", &token, Duration::from_secs(10)).await);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(lock.acquire("r", None).await.is_none(), "extended lease still held");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_degrades_to_not_acquired() {
        let store = MemoryBackend::new();
        let lock = lock_on(&store).await;
        let token = lock.acquire("r", None).await.unwrap();

        store.set_online(false);
        assert!(lock.acquire("other", None).await.is_none());
        assert!(!lock.release("r", &token).await);
        assert!(!lock.extend("r", &token, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_releases() {
        let store = MemoryBackend::new();
        let lock = lock_on(&store).await;

        assert_eq!(lock.with_lock("r", None, async { 7 }).await, Some(7));
        assert!(store.is_empty(), "lock released after work");

        let held = lock.acquire("r", None).await.unwrap();
        assert_eq!(lock.with_lock("r", None, async { 7 }).await, None);
        lock.release("r", &held).await;
    }
}
