// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the coordinator.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::cache::CacheStats;
use crate::concurrency::SlotStatus;
use crate::connection::{ConnectionHealth, ConnectionState};
use crate::monitor::OperationStats;
use crate::resilience::circuit_breaker::CircuitBreakerState;

/// Coordinator lifecycle state.
///
/// Observe changes with [`super::Coordinator::state_receiver()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Constructed, background work not started
    Created,
    /// Connecting to the backend and starting background tasks
    Starting,
    /// Serving (possibly degraded; see the connection health)
    Running,
    /// Stopping background tasks
    ShuttingDown,
    /// All background work stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Aggregate readiness/liveness report for a health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub state: EngineState,
    /// Connected and breaker closed
    pub healthy: bool,
    pub connection_state: ConnectionState,
    pub connection: ConnectionHealth,
    pub circuit_breaker: CircuitBreakerState,
    pub cache: CacheStats,
    pub concurrency: BTreeMap<String, SlotStatus>,
    pub operations: BTreeMap<String, OperationStats>,
}
