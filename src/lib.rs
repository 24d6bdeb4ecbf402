// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Coordination Engine
//!
//! Distributed coordination primitives for a multi-process application
//! backend, built on a Redis-compatible store with in-process fallbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Admission (per request/job)              │
//! │  • RateLimiter: fixed-window counters, fail-open            │
//! │  • ConcurrencyController: FIFO slots per job type           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Shared state                             │
//! │  • Cache: distributed or local, pub/sub invalidation        │
//! │  • DistributedLock: SET NX PX leases + token-checked delete │
//! │  • PartitioningStrategy: consistent hashing, 160 vnodes     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConnectionManager                        │
//! │  • single / cluster / sentinel topology                     │
//! │  • health loop, exponential reconnect, circuit breaker      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`PerformanceMonitor`] observes all of the above.
//!
//! ## Degradation
//!
//! Backend failures never reach callers except in two places:
//! [`ConnectionManager::get_connection`] fails with
//! [`ConnectionError::CircuitOpen`] while the breaker is open, and cache
//! operations reject malformed keys with [`CacheError::InvalidKey`].
//! Everything else degrades: the cache and rate limiter switch to local
//! state, the rate limiter allows requests it cannot check, and the lock
//! reports "not acquired".
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coord_engine::{Coordinator, CoordinationConfig, RateLimitOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = CoordinationConfig::default();
//!     config.concurrency.limits.insert("email".into(), 4);
//!
//!     let coordinator = Coordinator::new(config).expect("valid config");
//!     coordinator.start().await;
//!
//!     let options = RateLimitOptions::new(100, Duration::from_secs(60));
//!     let verdict = coordinator.rate_limiter().check_rate_limit("login", &options, "203.0.113.7").await;
//!     assert!(verdict.allowed);
//!
//!     coordinator.cache().set("user:1", b"alice".to_vec(), None).await.unwrap();
//!
//!     let _permit = coordinator.concurrency().acquire("email").await.unwrap();
//!
//!     if let Some(token) = coordinator.lock().acquire("report:daily", None).await {
//!         coordinator.lock().release("report:daily", &token).await;
//!     }
//!
//!     coordinator.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`Coordinator`] composition root
//! - [`connection`]: connection state machine, health, circuit breaking
//! - [`backend`]: backend contract, Redis and in-memory implementations
//! - [`partitioning`]: consistent-hash ring
//! - [`cache`]: dual-backend cache with invalidation
//! - [`rate_limit`]: fixed-window rate limiter
//! - [`concurrency`]: per-job-type admission control
//! - [`lock`]: lease-based distributed lock
//! - [`monitor`]: in-process latency statistics
//! - [`resilience`]: circuit breaker and retry policies

pub mod backend;
pub mod cache;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod lock;
pub mod metrics;
pub mod monitor;
pub mod partitioning;
pub mod pattern;
pub mod rate_limit;
pub mod resilience;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use backend::memory::MemoryBackend;
pub use backend::redis::{RedisBackend, RedisConnector};
pub use backend::{Backend, BackendError, Command, Connector, Reply, Subscription};
pub use cache::{BackendKind, Cache, CacheError, CacheStats};
pub use clock::Clock;
pub use concurrency::{ConcurrencyController, ConcurrencyError, ConcurrencyPermit, SlotStatus};
pub use config::{ConfigError, CoordinationConfig, Topology};
pub use connection::{Connection, ConnectionError, ConnectionHealth, ConnectionManager, ConnectionState};
pub use coordinator::{Coordinator, EngineState, HealthReport};
pub use lock::DistributedLock;
pub use metrics::LatencyTimer;
pub use monitor::{OperationStats, PerformanceMonitor};
pub use partitioning::{HashRing, PartitioningStrategy};
pub use rate_limit::{KeyStrategy, RateLimitOptions, RateLimitResult, RateLimiter, RequestIdentity};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitConfig};
pub use resilience::retry::RetryConfig;
