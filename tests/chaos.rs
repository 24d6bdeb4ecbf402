// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos testing for the coordination layer.
//!
//! Failure scenarios are driven by:
//! 1. **FailingBackend wrapper** - precise error injection on backend calls
//! 2. **Corrupt replies** - garbage where a well-formed reply is expected
//! 3. **Container killing** - abrupt Redis death mid-operation (ignored by default)
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos
//! cargo test --test chaos -- --ignored --nocapture   # container tests
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coord_engine::{
    Backend, BackendError, BackendKind, Command, Connector, ConnectionError, ConnectionState, Coordinator,
    CoordinationConfig, MemoryBackend, RateLimitOptions, Reply, Subscription, Topology,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Failing Backend Wrapper - Precise Error Injection
// =============================================================================

#[derive(Debug, Clone)]
enum Fault {
    /// Next `n` pipelines fail with `error`
    Fail { remaining: u64, error: BackendError },
    /// Every pipeline fails with `error` until healed
    FailAll(BackendError),
    /// Every reply is replaced with one of the wrong type
    Corrupt,
}

/// Memory backend with injectable faults on `execute`. Ping, scan and
/// subscribe pass through, so the health loop keeps reporting the link up
/// unless the inner store is taken offline.
#[derive(Clone)]
struct FailingBackend {
    inner: MemoryBackend,
    executes: Arc<AtomicU64>,
    fault: Arc<Mutex<Option<Fault>>>,
}

impl FailingBackend {
    fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            executes: Arc::new(AtomicU64::new(0)),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    fn fail_next(&self, n: u64, error: BackendError) {
        *self.fault.lock() = Some(Fault::Fail { remaining: n, error });
    }

    fn fail_all(&self, error: BackendError) {
        *self.fault.lock() = Some(Fault::FailAll(error));
    }

    fn corrupt(&self) {
        *self.fault.lock() = Some(Fault::Corrupt);
    }

    fn heal(&self) {
        *self.fault.lock() = None;
    }

    fn executes(&self) -> u64 {
        self.executes.load(Ordering::SeqCst)
    }

    /// Error to inject for this call, if any. Decrements one-shot faults.
    fn injected(&self) -> Option<Result<(), BackendError>> {
        let mut fault = self.fault.lock();
        match fault.as_mut() {
            None => None,
            Some(Fault::FailAll(error)) => Some(Err(error.clone())),
            Some(Fault::Corrupt) => Some(Ok(())),
            Some(Fault::Fail { remaining, error }) => {
                let error = error.clone();
                *remaining -= 1;
                if *remaining == 0 {
                    *fault = None;
                }
                Some(Err(error))
            }
        }
    }
}

#[async_trait]
impl Backend for FailingBackend {
    fn topology(&self) -> Topology {
        self.inner.topology()
    }

    fn nodes(&self) -> Vec<String> {
        self.inner.nodes()
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.inner.ping().await
    }

    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, BackendError> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        match self.injected() {
            None => self.inner.execute(commands).await,
            Some(Err(error)) => Err(error),
            Some(Ok(())) => Ok(commands.iter().map(|_| Reply::Int(-1)).collect()),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        self.inner.scan(pattern).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        self.inner.subscribe(channel).await
    }
}

#[async_trait]
impl Connector for FailingBackend {
    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError> {
        self.inner.ping().await?;
        Ok(Arc::new(self.clone()))
    }
}

fn config() -> CoordinationConfig {
    let mut config = CoordinationConfig::default();
    config.concurrency.limits.insert("import".into(), 1);
    config
}

async fn coordinator_over(backend: &FailingBackend) -> Coordinator {
    let coordinator = Coordinator::with_connector(config(), Arc::new(backend.clone())).unwrap();
    coordinator.start().await;
    assert!(coordinator.connection().is_healthy());
    coordinator
}

fn timeout_error() -> BackendError {
    BackendError::Timeout(Duration::from_secs(2))
}

// =============================================================================
// Error Injection Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn chaos_rate_limiter_fails_open_on_every_error() {
    let backend = FailingBackend::new(MemoryBackend::new());
    let coordinator = coordinator_over(&backend).await;
    let options = RateLimitOptions::new(1, Duration::from_secs(60));

    // Command-level errors do not move the breaker, so the limiter keeps
    // trying the backend and keeps allowing
    backend.fail_all(BackendError::Command("NOSCRIPT".into()));
    for _ in 0..20 {
        let verdict = coordinator.rate_limiter().check_rate_limit("login", &options, "10.1.1.1").await;
        assert!(verdict.allowed);
        assert!(verdict.retry_after_seconds.is_none());
    }
    assert!(coordinator.connection().is_healthy());

    backend.heal();
    assert!(coordinator.rate_limiter().check_rate_limit("login", &options, "10.1.1.1").await.allowed);
    assert!(!coordinator.rate_limiter().check_rate_limit("login", &options, "10.1.1.1").await.allowed);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_rate_limiter_fails_open_on_corrupt_reply() {
    let backend = FailingBackend::new(MemoryBackend::new());
    let coordinator = coordinator_over(&backend).await;
    let options = RateLimitOptions::new(1, Duration::from_secs(60));

    backend.corrupt();
    for _ in 0..3 {
        assert!(coordinator.rate_limiter().check_rate_limit("api", &options, "c").await.allowed);
    }
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_cache_write_falls_through_to_local() {
    let store = MemoryBackend::new();
    let backend = FailingBackend::new(store.clone());
    let coordinator = coordinator_over(&backend).await;
    let cache = coordinator.cache();

    backend.fail_next(1, timeout_error());
    cache.set("session:9", b"token".to_vec(), None).await.unwrap();
    assert_eq!(cache.local().len(), 1, "failed write kept locally");
    assert!(store.is_empty());

    // Still healthy: reads go to the backend, which never saw the write
    assert_eq!(cache.get("session:9").await.unwrap(), None);

    // Once the backend is declared down, the local copy serves reads
    store.set_online(false);
    coordinator.connection().health_check().await;
    assert!(!coordinator.connection().is_healthy());
    assert_eq!(cache.get("session:9").await.unwrap(), Some(b"token".to_vec()));
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_cache_batch_write_partial_failure() {
    let backend = FailingBackend::new(MemoryBackend::new());
    let coordinator = coordinator_over(&backend).await;
    let cache = coordinator.cache();

    backend.fail_next(1, timeout_error());
    cache
        .mset(&[("a", b"1".to_vec()), ("b", b"2".to_vec())], None)
        .await
        .unwrap();
    assert_eq!(cache.local().len(), 2);

    // Reads on a corrupt backend are misses, never errors
    backend.corrupt();
    assert_eq!(cache.mget(&["a", "b"]).await.unwrap(), vec![None, None]);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_breaker_trips_and_recovers() {
    let store = MemoryBackend::new();
    let backend = FailingBackend::new(store.clone());
    let coordinator = coordinator_over(&backend).await;
    let connection = coordinator.connection();

    backend.fail_all(timeout_error());
    for i in 0..5 {
        coordinator.cache().set(&format!("k{}", i), b"v".to_vec(), None).await.unwrap();
    }
    assert!(connection.is_circuit_breaker_open());
    assert_eq!(connection.state(), ConnectionState::CircuitOpen);
    assert_eq!(connection.get_connection().err(), Some(ConnectionError::CircuitOpen));

    // While open nothing touches the backend
    let before = backend.executes();
    coordinator.cache().set("later", b"v".to_vec(), None).await.unwrap();
    assert!(coordinator.lock().acquire("r", None).await.is_none());
    let options = RateLimitOptions::new(5, Duration::from_secs(60));
    assert!(coordinator.rate_limiter().check_rate_limit("api", &options, "c").await.allowed);
    assert_eq!(backend.executes(), before);
    assert_eq!(coordinator.cache().get_stats().await.backend_kind, BackendKind::Local);

    // Cooldown closes the breaker; the follow-up health check reconnects
    backend.heal();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!connection.is_circuit_breaker_open());
    assert!(connection.is_healthy());
    assert!(coordinator.lock().acquire("r", None).await.is_some());
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_lock_degrades_to_not_acquired() {
    let backend = FailingBackend::new(MemoryBackend::new());
    let coordinator = coordinator_over(&backend).await;
    let lock = coordinator.lock();

    let token = lock.acquire("invoice:1", None).await.unwrap();
    backend.fail_next(3, BackendError::Connection("reset by peer".into()));
    assert!(lock.acquire("invoice:2", None).await.is_none());
    assert!(!lock.release("invoice:1", &token).await);
    assert!(!lock.extend("invoice:1", &token, Duration::from_secs(5)).await);

    // Fault cleared: the original lease is still ours
    assert!(lock.release("invoice:1", &token).await);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_outage_at_startup_then_recovery() {
    let store = MemoryBackend::new();
    store.set_online(false);
    let backend = FailingBackend::new(store.clone());
    let coordinator = Coordinator::with_connector(config(), Arc::new(backend.clone())).unwrap();

    coordinator.start().await;
    assert!(!coordinator.connection().is_healthy());
    coordinator.cache().set("warm", b"1".to_vec(), None).await.unwrap();
    assert_eq!(coordinator.cache().local().len(), 1);

    store.set_online(true);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(coordinator.connection().is_healthy());

    // Local entries are not reconciled into the backend
    assert_eq!(coordinator.cache().get("warm").await.unwrap(), None);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_concurrency_unaffected_by_backend_outage() {
    let store = MemoryBackend::new();
    store.set_online(false);
    let backend = FailingBackend::new(store);
    let coordinator = Coordinator::with_connector(config(), Arc::new(backend)).unwrap();
    coordinator.start().await;

    let concurrency = coordinator.concurrency().clone();
    let result = concurrency
        .run("import", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            42
        })
        .await
        .unwrap();
    assert_eq!(result, 42);
    assert_eq!(concurrency.get_status()["import"].current_running, 0);
    coordinator.shutdown().await;
}

// =============================================================================
// Chaos Tests - Container Killing (Abrupt Death)
// =============================================================================

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

#[tokio::test]
#[ignore] // Requires Docker
async fn chaos_redis_killed_mid_operation() {
    // Test: Redis dies while the coordinator is serving
    // Expected: cache and rate limiter keep working on local state

    let docker = Cli::default();
    let redis = redis_container(&docker);
    let port = redis.get_host_port_ipv4(6379);

    let mut config = config();
    config.backend.url = format!("redis://127.0.0.1:{}", port);
    config.backend.command_timeout_ms = 500;
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.start().await;
    assert!(coordinator.connection().is_healthy());

    coordinator.cache().set("before", b"1".to_vec(), None).await.unwrap();

    drop(redis);
    println!("Redis killed!");

    let health = coordinator.connection().health_check().await;
    assert!(!health.is_connected);
    assert!(health.last_error.is_some());

    coordinator.cache().set("after", b"2".to_vec(), None).await.unwrap();
    assert_eq!(coordinator.cache().get("after").await.unwrap(), Some(b"2".to_vec()));

    let options = RateLimitOptions::new(1, Duration::from_secs(60));
    let limiter = coordinator.rate_limiter();
    assert!(limiter.check_rate_limit("api", &options, "c").await.allowed);
    assert!(!limiter.check_rate_limit("api", &options, "c").await.allowed, "local window enforces limit");

    let _ = tokio::time::timeout(Duration::from_secs(2), coordinator.shutdown()).await;
}
