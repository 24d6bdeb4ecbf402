// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Composition root.
//!
//! The [`Coordinator`] builds every coordination component from one
//! [`CoordinationConfig`] and owns their lifecycle:
//! - [`ConnectionManager`]: backend handle, health loop, circuit breaker
//! - [`PartitioningStrategy`]: consistent-hash placement for callers
//! - [`Cache`], [`RateLimiter`], [`DistributedLock`]: backend-backed services
//! - [`ConcurrencyController`], [`PerformanceMonitor`]: in-process only
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use coord_engine::{Coordinator, CoordinationConfig, EngineState};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let coordinator = Coordinator::new(CoordinationConfig::default()).expect("valid config");
//! assert_eq!(coordinator.state(), EngineState::Created);
//!
//! coordinator.start().await;
//! let report = coordinator.health_report().await;
//! println!("{}", serde_json::to_string_pretty(&report).unwrap());
//! coordinator.shutdown().await;
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{EngineState, HealthReport};

use std::sync::Arc;
use tokio::sync::watch;

use crate::backend::redis::RedisConnector;
use crate::backend::Connector;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::concurrency::ConcurrencyController;
use crate::config::{ConfigError, CoordinationConfig};
use crate::connection::ConnectionManager;
use crate::lock::DistributedLock;
use crate::monitor::PerformanceMonitor;
use crate::partitioning::PartitioningStrategy;
use crate::rate_limit::RateLimiter;

/// Owns every coordination component. Hand out clones of the component
/// handles (they are all cheap to clone) to request handlers and workers.
pub struct Coordinator {
    config: CoordinationConfig,
    state: watch::Sender<EngineState>,
    connection: ConnectionManager,
    partitioning: Arc<PartitioningStrategy>,
    cache: Cache,
    rate_limiter: RateLimiter,
    lock: DistributedLock,
    concurrency: ConcurrencyController,
    monitor: Arc<PerformanceMonitor>,
}

impl Coordinator {
    /// Coordinator backed by Redis in the configured topology.
    pub fn new(config: CoordinationConfig) -> Result<Self, ConfigError> {
        let connector = Arc::new(RedisConnector::new(config.backend.clone()));
        Self::with_connector(config, connector)
    }

    /// Coordinator over any backend connector (e.g. the in-memory backend).
    pub fn with_connector(config: CoordinationConfig, connector: Arc<dyn Connector>) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock = Clock::new();
        let connection = ConnectionManager::new(connector, &config);
        let partitioning = Arc::new(PartitioningStrategy::new(
            &config.ring_nodes(),
            config.partitioning.virtual_nodes,
        ));
        let monitor = Arc::new(PerformanceMonitor::new(&config.monitor));
        let cache = Cache::new(connection.clone(), Arc::clone(&monitor), config.cache.clone(), clock);
        let rate_limiter = RateLimiter::new(connection.clone(), Arc::clone(&monitor), &config.rate_limit, clock);
        let lock = DistributedLock::new(connection.clone(), Arc::clone(&monitor), &config.lock);
        let concurrency = ConcurrencyController::new(&config.concurrency.limits);
        let (state, _) = watch::channel(EngineState::Created);

        Ok(Self {
            config,
            state,
            connection,
            partitioning,
            cache,
            rate_limiter,
            lock,
            concurrency,
            monitor,
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn partitioning(&self) -> &Arc<PartitioningStrategy> {
        &self.partitioning
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    #[must_use]
    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    #[must_use]
    pub fn concurrency(&self) -> &ConcurrencyController {
        &self.concurrency
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Aggregate health for readiness endpoints.
    pub async fn health_report(&self) -> HealthReport {
        HealthReport {
            state: self.state(),
            healthy: self.connection.is_healthy(),
            connection_state: self.connection.state(),
            connection: self.connection.get_health_status(),
            circuit_breaker: self.connection.circuit_breaker_state(),
            cache: self.cache.get_stats().await,
            concurrency: self.concurrency.get_status(),
            operations: self.monitor.get_stats(),
        }
    }
}
