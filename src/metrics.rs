// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for coord-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `coord_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: cache, rate_limit, lock, concurrency, connection
//! - `backend`: distributed, local
//! - `status`/`outcome`: success, error, rejected, fallback

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a completed component operation
pub fn record_operation(component: &str, operation: &str, status: &str) {
    counter!(
        "coord_engine_operations_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "coord_engine_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// Connection
// ═══════════════════════════════════════════════════════════════════════════

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "coord_engine_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Last measured ping round trip
pub fn set_backend_latency(latency: Duration) {
    histogram!("coord_engine_backend_ping_seconds").record(latency.as_secs_f64());
}

/// Record a connectivity failure
pub fn record_connection_error(backend: &str) {
    counter!(
        "coord_engine_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record a reconnection attempt (`attempt` is 1-based)
pub fn record_reconnect_attempt(attempt: u32) {
    counter!("coord_engine_reconnect_attempts_total").increment(1);
    gauge!("coord_engine_reconnect_attempt").set(f64::from(attempt));
}

/// Set connection state label as a gauge per state
pub fn set_connection_state(state: &str) {
    gauge!(
        "coord_engine_connection_state",
        "state" => state.to_string()
    )
    .set(1.0);
}

/// Set circuit breaker state (0 = closed, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "coord_engine_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(f64::from(state));
}

/// Record a call observed by a circuit breaker
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "coord_engine_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the breaker tripping open
pub fn record_circuit_trip(circuit: &str) {
    counter!(
        "coord_engine_circuit_breaker_trips_total",
        "circuit" => circuit.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache read (hit or miss) against a backend
pub fn record_cache_access(backend: &str, hit: bool) {
    counter!(
        "coord_engine_cache_access_total",
        "backend" => backend.to_string(),
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record a distributed write that fell back to the local map
pub fn record_cache_fallback(operation: &str) {
    counter!(
        "coord_engine_cache_fallback_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set local cache entry count
pub fn set_local_cache_items(count: usize) {
    gauge!("coord_engine_local_cache_items").set(count as f64);
}

/// Record entries removed by the local sweep
pub fn record_local_eviction(expired: usize, evicted: usize) {
    counter!("coord_engine_local_cache_expired_total").increment(expired as u64);
    counter!("coord_engine_local_cache_evicted_total").increment(evicted as u64);
}

/// Record a pattern invalidation (`source`: local or remote)
pub fn record_invalidation(source: &str, keys: usize) {
    counter!(
        "coord_engine_cache_invalidations_total",
        "source" => source.to_string()
    )
    .increment(1);
    histogram!(
        "coord_engine_cache_invalidated_keys",
        "source" => source.to_string()
    )
    .record(keys as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// Rate limiting, locks, concurrency
// ═══════════════════════════════════════════════════════════════════════════

/// Record a rate-limit decision (`decision`: allowed, denied, fail_open)
pub fn record_rate_limit_decision(route: &str, backend: &str, decision: &str) {
    counter!(
        "coord_engine_rate_limit_decisions_total",
        "route" => route.to_string(),
        "backend" => backend.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// Record a lock operation outcome
pub fn record_lock_operation(operation: &str, outcome: &str) {
    counter!(
        "coord_engine_lock_operations_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set running/queued gauges for a job type
pub fn set_concurrency_slot(job_type: &str, running: usize, queued: usize) {
    gauge!(
        "coord_engine_concurrency_running",
        "job_type" => job_type.to_string()
    )
    .set(running as f64);
    gauge!(
        "coord_engine_concurrency_queued",
        "job_type" => job_type.to_string()
    )
    .set(queued as f64);
}

/// Record how long an acquisition waited in the queue
pub fn record_concurrency_wait(job_type: &str, waited: Duration) {
    histogram!(
        "coord_engine_concurrency_wait_seconds",
        "job_type" => job_type.to_string()
    )
    .record(waited.as_secs_f64());
}

/// Record an admission for a job type with no configured limit
pub fn record_concurrency_unbounded(job_type: &str) {
    counter!(
        "coord_engine_concurrency_unbounded_total",
        "job_type" => job_type.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup duration
pub fn record_startup_total(duration: Duration) {
    histogram!("coord_engine_startup_seconds").record(duration.as_secs_f64());
}

/// Set coordinator state (as a label gauge)
pub fn set_engine_state(state: &str) {
    gauge!(
        "coord_engine_state",
        "state" => state.to_string()
    )
    .set(1.0);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
