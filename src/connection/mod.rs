// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilient connection to the distributed store.
//!
//! [`ConnectionManager`] owns the one logical backend handle shared by every
//! coordination component. It keeps that handle healthy across the single,
//! cluster and sentinel topologies:
//!
//! ```text
//!  initialize() ──► connect + ping ──ok──► Connected ◄──────────────┐
//!                        │                    │ ping fails           │
//!                      error                  ▼                      │
//!                        │            reconnect loop ─── ok ─────────┘
//!                        ▼            (base * 2^n, ≤ max attempts,
//!                 breaker.record_failure()   aborted while open)
//!                        │ threshold reached
//!                        ▼
//!                   CircuitOpen ── cooldown ──► check again
//! ```
//!
//! Connection failures never escape [`ConnectionManager::initialize`]; they
//! become state. The only hard error is [`ConnectionError::CircuitOpen`] from
//! [`ConnectionManager::get_connection`].

pub mod state;

pub use state::{ConnectionEvent, ConnectionState};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, Command, Connector, Reply, Subscription, Topology};
use crate::config::CoordinationConfig;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitConfig};
use crate::resilience::retry::RetryConfig;

const BREAKER_NAME: &str = "backend";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The breaker is open; callers must not touch the backend.
    #[error("Circuit breaker is open; backend calls are rejected")]
    CircuitOpen,
    #[error("No backend connection established")]
    NotConnected,
}

impl From<ConnectionError> for BackendError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::CircuitOpen => BackendError::CircuitOpen,
            ConnectionError::NotConnected => BackendError::Connection(err.to_string()),
        }
    }
}

/// Health as reported to readiness endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub is_connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_state: Option<String>,
}

#[derive(Debug, Default)]
struct HealthDetails {
    latency_ms: u64,
    last_error: Option<String>,
    node_count: Option<usize>,
    cluster_state: Option<String>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    topology: Topology,
    breaker: CircuitBreaker,
    reconnect: RetryConfig,
    health_interval: Duration,
    backend: RwLock<Option<Arc<dyn Backend>>>,
    state: watch::Sender<ConnectionState>,
    details: RwLock<HealthDetails>,
    reconnecting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to the connection manager. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: &CoordinationConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                topology: config.backend.topology,
                breaker: CircuitBreaker::new(BREAKER_NAME, CircuitConfig::from(&config.circuit)),
                reconnect: RetryConfig::reconnect(config.reconnect.base_delay(), config.reconnect.max_attempts),
                health_interval: config.health.interval(),
                backend: RwLock::new(None),
                state,
                details: RwLock::new(HealthDetails::default()),
                reconnecting: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connect, ping, and start the periodic health check.
    ///
    /// Never fails: a backend that cannot be reached leaves the manager in a
    /// degraded state (`is_healthy() == false`) with reconnection scheduled.
    #[tracing::instrument(skip(self), fields(topology = %self.inner.topology))]
    pub async fn initialize(&self) {
        info!("Initializing backend connection");
        if let Err(e) = self.inner.connect_once().await {
            warn!(error = %e, "Backend unavailable at startup; running degraded");
            self.inner.schedule_reconnect();
        }
        self.start_health_loop();
    }

    fn start_health_loop(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.health_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.health_check().await;
            }
        });
        self.inner.track(handle);
    }

    /// Connected and breaker closed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }

    /// Live backend handle.
    ///
    /// Fails hard with [`ConnectionError::CircuitOpen`] while the breaker is
    /// open, and with [`ConnectionError::NotConnected`] before the first
    /// successful connection.
    pub fn get_connection(&self) -> Result<Connection, ConnectionError> {
        if self.inner.breaker.is_open() {
            crate::metrics::record_circuit_breaker_call(BREAKER_NAME, "rejected");
            return Err(ConnectionError::CircuitOpen);
        }
        let backend = self.inner.backend.read().clone().ok_or(ConnectionError::NotConnected)?;
        Ok(Connection {
            backend,
            manager: Arc::clone(&self.inner),
        })
    }

    #[must_use]
    pub fn is_circuit_breaker_open(&self) -> bool {
        self.inner.breaker.is_open()
    }

    /// Manually clear the breaker (remediation action for operators).
    pub fn reset_circuit_breaker(&self) {
        let was_open = self.inner.breaker.is_open();
        self.inner.breaker.reset();
        if was_open {
            self.inner.transition(ConnectionEvent::CircuitReset);
        }
    }

    #[must_use]
    pub fn circuit_breaker_state(&self) -> CircuitBreakerState {
        self.inner.breaker.snapshot()
    }

    #[must_use]
    pub fn get_health_status(&self) -> ConnectionHealth {
        self.inner.health_snapshot()
    }

    /// Ping the backend now and update health. Also used by the periodic loop.
    pub async fn health_check(&self) -> ConnectionHealth {
        self.inner.health_check().await
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn topology(&self) -> Topology {
        self.inner.topology
    }

    /// Stop background work and drop the backend handle.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.backend.write().take();
        self.inner.transition(ConnectionEvent::Shutdown);
        crate::metrics::set_backend_healthy(BREAKER_NAME, false);
        info!("Backend connection closed");
    }
}

impl Inner {
    fn is_healthy(&self) -> bool {
        self.state.borrow().is_connected() && !self.breaker.is_open()
    }

    fn health_snapshot(&self) -> ConnectionHealth {
        let details = self.details.read();
        ConnectionHealth {
            is_connected: self.state.borrow().is_connected(),
            latency_ms: details.latency_ms,
            last_error: details.last_error.clone(),
            node_count: details.node_count,
            cluster_state: details.cluster_state.clone(),
        }
    }

    fn transition(&self, event: ConnectionEvent) -> ConnectionState {
        let mut next = ConnectionState::Disconnected;
        self.state.send_if_modified(|state| {
            next = state.on_event(event);
            if next == *state {
                return false;
            }
            debug!(from = %state, to = %next, ?event, "Connection state changed");
            *state = next;
            true
        });
        crate::metrics::set_connection_state(&next.to_string());
        crate::metrics::set_backend_healthy(BREAKER_NAME, self.is_healthy());
        next
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// One connect + ping attempt. Success installs the new handle.
    async fn connect_once(self: &Arc<Self>) -> Result<(), BackendError> {
        self.transition(ConnectionEvent::ConnectRequested);
        let started = Instant::now();

        let attempt = async {
            let backend = self.connector.connect().await?;
            backend.ping().await?;
            Ok::<_, BackendError>(backend)
        };

        match attempt.await {
            Ok(backend) => {
                let latency = started.elapsed();
                let cluster_state = backend.cluster_state().await.ok().flatten();
                {
                    let mut details = self.details.write();
                    details.latency_ms = latency.as_millis() as u64;
                    details.node_count = Some(backend.nodes().len());
                    details.cluster_state = cluster_state;
                    details.last_error = None;
                }
                *self.backend.write() = Some(backend);
                self.breaker.record_success();
                crate::metrics::set_backend_latency(latency);
                let state = self.transition(ConnectionEvent::ConnectSucceeded);
                info!(latency_ms = latency.as_millis() as u64, %state, "Backend connected");
                Ok(())
            }
            Err(e) => {
                self.on_failure(&e);
                self.transition(ConnectionEvent::ConnectFailed);
                Err(e)
            }
        }
    }

    /// Count a connectivity failure; trip and schedule the cooldown if needed.
    fn on_failure(self: &Arc<Self>, error: &BackendError) {
        self.details.write().last_error = Some(error.to_string());
        crate::metrics::record_connection_error(BREAKER_NAME);
        if let Some(generation) = self.breaker.record_failure() {
            self.transition(ConnectionEvent::CircuitTripped);
            self.schedule_cooldown(generation);
        }
    }

    fn schedule_cooldown(self: &Arc<Self>, generation: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cooldown = self.breaker.config().cooldown;
        let handle = tokio::spawn(async move {
            sleep(cooldown).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.breaker.expire_cooldown(generation) {
                inner.transition(ConnectionEvent::CircuitReset);
                // Cooldown closes the breaker blindly; check right away
                inner.health_check().await;
            }
        });
        self.track(handle);
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let Some(inner) = weak.upgrade() else { return };
                if inner.state.borrow().is_connected() {
                    break;
                }
                if inner.breaker.is_open() {
                    info!("Circuit breaker open; abandoning reconnection");
                    break;
                }
                if !inner.reconnect.allows(attempt as usize) {
                    warn!(attempts = attempt, "Reconnection attempts exhausted");
                    inner.transition(ConnectionEvent::ReconnectExhausted);
                    break;
                }

                let delay = inner.reconnect.delay_for(attempt);
                attempt += 1;
                inner.transition(ConnectionEvent::ReconnectScheduled(attempt));
                crate::metrics::record_reconnect_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                drop(inner);

                sleep(delay).await;

                let Some(inner) = weak.upgrade() else { return };
                if inner.breaker.is_open() || inner.state.borrow().is_connected() {
                    continue;
                }
                if inner.connect_once().await.is_ok() {
                    info!(attempt, "Reconnected to backend");
                    break;
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.reconnecting.store(false, Ordering::Release);
            }
        });
        self.track(handle);
    }

    async fn health_check(self: &Arc<Self>) -> ConnectionHealth {
        let backend = self.backend.read().clone();
        match backend {
            None => {
                if !self.reconnecting.load(Ordering::Acquire) {
                    let _ = self.connect_once().await;
                }
            }
            Some(backend) => {
                let started = Instant::now();
                match backend.ping().await {
                    Ok(()) => {
                        let latency = started.elapsed();
                        let cluster_state = backend.cluster_state().await.ok().flatten();
                        {
                            let mut details = self.details.write();
                            details.latency_ms = latency.as_millis() as u64;
                            details.node_count = Some(backend.nodes().len());
                            if cluster_state.is_some() {
                                details.cluster_state = cluster_state;
                            }
                        }
                        self.breaker.record_success();
                        crate::metrics::set_backend_latency(latency);
                        self.transition(ConnectionEvent::ConnectSucceeded);
                    }
                    Err(e) => {
                        warn!(error = %e, "Backend health check failed");
                        self.on_failure(&e);
                        self.transition(ConnectionEvent::ConnectionLost);
                        self.schedule_reconnect();
                    }
                }
            }
        }
        self.health_snapshot()
    }
}

/// Backend handle handed out by [`ConnectionManager::get_connection`].
///
/// Every call reports its outcome back to the manager: connectivity errors
/// feed the circuit breaker, successes clear the failure run.
#[derive(Clone)]
pub struct Connection {
    backend: Arc<dyn Backend>,
    manager: Arc<Inner>,
}

impl Connection {
    fn observe<T>(&self, result: &Result<T, BackendError>) {
        match result {
            Ok(_) => self.manager.breaker.record_success(),
            Err(e) if e.is_connectivity() => self.manager.on_failure(e),
            Err(_) => {}
        }
    }

    #[must_use]
    pub fn topology(&self) -> Topology {
        self.backend.topology()
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        self.backend.nodes()
    }

    pub async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, BackendError> {
        let result = self.backend.execute(commands).await;
        self.observe(&result);
        result
    }

    pub async fn execute_one(&self, command: Command) -> Result<Reply, BackendError> {
        let result = self.backend.execute_one(command).await;
        self.observe(&result);
        result
    }

    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let result = self.backend.scan(pattern).await;
        self.observe(&result);
        result
    }

    pub async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        let result = self.backend.subscribe(channel).await;
        self.observe(&result);
        result
    }

    pub async fn memory_bytes(&self) -> Result<Option<u64>, BackendError> {
        let result = self.backend.memory_bytes().await;
        self.observe(&result);
        result
    }
}
