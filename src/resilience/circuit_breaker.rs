// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consecutive-failure circuit breaker.
//!
//! Protects callers from hammering a backend that keeps failing. Every
//! connectivity failure increments a counter; reaching the threshold trips
//! the breaker open. Any success clears the counter but does not close an
//! open breaker early.
//!
//! ```text
//!            failure (n < threshold)
//!              ┌──────────┐
//!              ▼          │
//!         ┌─────────┐ ────┘         ┌────────┐
//!         │ Closed  │ ─────────────►│  Open  │  calls rejected
//!         └─────────┘  n == thresh  └────────┘
//!              ▲                         │
//!              └─────────────────────────┘
//!                cooldown elapsed / reset()
//! ```
//!
//! The breaker does not own a timer. The owner schedules
//! [`CircuitBreaker::expire_cooldown`] with the generation returned on trip;
//! a manual [`reset`](CircuitBreaker::reset) bumps the generation so a stale
//! cooldown cannot close a breaker that tripped again in the meantime.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CircuitSettings;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before closing on its own
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&CircuitSettings> for CircuitConfig {
    fn from(settings: &CircuitSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            cooldown: settings.cooldown(),
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub open: bool,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub cooldown_ms: u64,
    /// Times the breaker has opened since startup
    pub trips: u64,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    open: AtomicBool,
    consecutive_failures: AtomicU32,
    generation: AtomicU64,
    trips: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            open: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        };
        crate::metrics::set_circuit_state(&breaker.name, CircuitState::Closed as u8);
        breaker
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Get current circuit state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Generation of the current open period; pass it to
    /// [`expire_cooldown`](Self::expire_cooldown).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            open: self.is_open(),
            consecutive_failures: self.consecutive_failures(),
            threshold: self.config.failure_threshold,
            cooldown_ms: self.config.cooldown.as_millis() as u64,
            trips: self.trips(),
        }
    }

    /// A success clears the failure run. An open breaker stays open.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Count a connectivity failure. Returns `Some(generation)` when this
    /// failure tripped the breaker, so the caller can schedule its cooldown.
    pub fn record_failure(&self) -> Option<u64> {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if failures < self.config.failure_threshold {
            debug!(circuit = %self.name, failures, "Circuit failure recorded");
            return None;
        }

        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.trips.fetch_add(1, Ordering::Relaxed);
        warn!(
            circuit = %self.name,
            failures,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "Circuit breaker opened"
        );
        crate::metrics::set_circuit_state(&self.name, CircuitState::Open as u8);
        crate::metrics::record_circuit_trip(&self.name);
        Some(generation)
    }

    /// Close the breaker after its cooldown, unless it was reset (and maybe
    /// re-tripped) since `generation` was issued. Returns true if it closed.
    pub fn expire_cooldown(&self, generation: u64) -> bool {
        if self.generation() != generation || !self.is_open() {
            return false;
        }
        self.close("cooldown elapsed");
        true
    }

    /// Manually close the breaker and clear the failure run.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.close("manual reset");
    }

    fn close(&self, reason: &'static str) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.open.swap(false, Ordering::AcqRel) {
            info!(circuit = %self.name, reason, "Circuit breaker closed");
        }
        crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
    }

    /// Number of times the breaker has opened
    #[must_use]
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}
