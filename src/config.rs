// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the coordination layer.
//!
//! The configuration is loaded once at startup and treated as immutable for
//! the lifetime of the process. The only exception is the partitioning node
//! list, which can be swapped at runtime via
//! [`PartitioningStrategy::rebalance`](crate::partitioning::PartitioningStrategy::rebalance).
//!
//! # Example
//!
//! ```
//! use coord_engine::{CoordinationConfig, Topology};
//!
//! // Minimal config (single Redis node on localhost)
//! let config = CoordinationConfig::default();
//! assert_eq!(config.backend.topology, Topology::Single);
//! assert_eq!(config.circuit.failure_threshold, 5);
//!
//! // Sharded cluster
//! let mut config = CoordinationConfig::default();
//! config.backend.topology = Topology::Cluster;
//! config.backend.nodes = vec![
//!     "redis://10.0.0.1:6379".into(),
//!     "redis://10.0.0.2:6379".into(),
//! ];
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// Backend deployment shape, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// One standalone node.
    #[default]
    Single,
    /// Sharded cluster; keys are spread over the configured nodes.
    Cluster,
    /// Sentinel-monitored primary/replica pair.
    Sentinel,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Cluster => write!(f, "cluster"),
            Self::Sentinel => write!(f, "sentinel"),
        }
    }
}

/// Top-level configuration.
///
/// All fields have sensible defaults; every section can be omitted when
/// deserializing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub circuit: CircuitSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub partitioning: PartitioningSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl CoordinationConfig {
    /// Reject values that would make a component meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend.topology {
            Topology::Single if self.backend.url.trim().is_empty() => {
                return Err(ConfigError::invalid("backend.url", "must not be empty"));
            }
            Topology::Cluster if self.backend.nodes.is_empty() => {
                return Err(ConfigError::invalid("backend.nodes", "cluster topology needs at least one node"));
            }
            Topology::Sentinel => {
                if self.backend.nodes.is_empty() {
                    return Err(ConfigError::invalid("backend.nodes", "sentinel topology needs at least one sentinel"));
                }
                if self.backend.sentinel_master.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::invalid("backend.sentinel_master", "required for sentinel topology"));
                }
            }
            _ => {}
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit.failure_threshold", "must be at least 1"));
        }
        if self.partitioning.virtual_nodes == 0 {
            return Err(ConfigError::invalid("partitioning.virtual_nodes", "must be at least 1"));
        }
        if self.rate_limit.default_window_ms == 0 {
            return Err(ConfigError::invalid("rate_limit.default_window_ms", "must be positive"));
        }
        if self.cache.namespace.is_empty() {
            return Err(ConfigError::invalid("cache.namespace", "must not be empty"));
        }
        // Periodic tasks cannot tick with a zero period
        let periods = [
            ("health.interval_ms", self.health.interval_ms),
            ("cache.sweep_interval_ms", self.cache.sweep_interval_ms),
            ("cache.resubscribe_ms", self.cache.resubscribe_ms),
            ("rate_limit.cleanup_interval_ms", self.rate_limit.cleanup_interval_ms),
        ];
        if let Some((field, _)) = periods.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::invalid(*field, "must be positive"));
        }
        if let Some((job, _)) = self.concurrency.limits.iter().find(|(_, max)| **max == 0) {
            return Err(ConfigError::invalid("concurrency.limits", format!("limit for '{}' must be positive", job)));
        }
        Ok(())
    }

    /// Nodes used to seed the hash ring.
    ///
    /// Falls back to the backend node list (or the single URL) when no
    /// explicit partitioning nodes are configured.
    #[must_use]
    pub fn ring_nodes(&self) -> Vec<String> {
        if !self.partitioning.nodes.is_empty() {
            return self.partitioning.nodes.clone();
        }
        match self.backend.topology {
            Topology::Single => vec![self.backend.url.clone()],
            Topology::Cluster | Topology::Sentinel => self.backend.nodes.clone(),
        }
    }
}

/// Connection settings for the distributed store.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub topology: Topology,

    /// Connection string for single-node topology (e.g. "redis://localhost:6379")
    #[serde(default = "default_url")]
    pub url: String,

    /// Cluster seed nodes, or sentinel addresses for the sentinel topology
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Name of the monitored primary (sentinel topology only)
    #[serde(default)]
    pub sentinel_master: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl BackendConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            url: default_url(),
            nodes: Vec::new(),
            sentinel_master: None,
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitSettings {
    /// Consecutive connection failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the breaker stays open before it is cleared automatically
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl CircuitSettings {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSettings {
    /// First backoff delay; attempt `n` waits `base_delay_ms * 2^n`
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_ms(),
            max_attempts: default_reconnect_max_attempts(),
        }
    }
}

impl ReconnectSettings {
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { interval_ms: default_health_interval_ms() }
    }
}

impl HealthSettings {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitioningSettings {
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    /// Explicit ring members; empty means "derive from backend config"
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl Default for PartitioningSettings {
    fn default() -> Self {
        Self {
            virtual_nodes: default_virtual_nodes(),
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Prefix applied to every logical key before it reaches a backend
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Hard cap on local fallback entries, enforced by the sweep
    #[serde(default = "default_max_local_entries")]
    pub max_local_entries: usize,
    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,
    /// Delay between attempts to (re)establish the invalidation subscription
    #[serde(default = "default_resubscribe_ms")]
    pub resubscribe_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: default_cache_namespace(),
            default_ttl_secs: default_cache_ttl_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_local_entries: default_max_local_entries(),
            invalidation_channel: default_invalidation_channel(),
            resubscribe_ms: default_resubscribe_ms(),
        }
    }
}

impl CacheSettings {
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    #[must_use]
    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_rate_limit_prefix")]
    pub prefix: String,
    #[serde(default = "default_rate_limit")]
    pub default_limit: u64,
    #[serde(default = "default_rate_window_ms")]
    pub default_window_ms: u64,
    /// Interval of the sweep that drops expired local windows
    #[serde(default = "default_sweep_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            prefix: default_rate_limit_prefix(),
            default_limit: default_rate_limit(),
            default_window_ms: default_rate_window_ms(),
            cleanup_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RateLimitSettings {
    #[must_use]
    pub fn default_window(&self) -> Duration {
        Duration::from_millis(self.default_window_ms)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_lock_prefix")]
    pub prefix: String,
    #[serde(default = "default_lock_ttl_ms")]
    pub default_ttl_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            prefix: default_lock_prefix(),
            default_ttl_ms: default_lock_ttl_ms(),
        }
    }
}

impl LockSettings {
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConcurrencySettings {
    /// Job type -> maximum simultaneously running units
    #[serde(default)]
    pub limits: HashMap<String, usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    /// Operations at or above this latency are logged as slow
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    /// Latency samples retained per operation for percentile estimates
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            slow_threshold_ms: default_slow_threshold_ms(),
            max_samples: default_max_samples(),
        }
    }
}

impl MonitorSettings {
    #[must_use]
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }
}

fn default_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_command_timeout_ms() -> u64 { 2_000 }
fn default_failure_threshold() -> u32 { 5 }
fn default_cooldown_ms() -> u64 { 30_000 }
fn default_reconnect_base_ms() -> u64 { 1_000 }
fn default_reconnect_max_attempts() -> u32 { 10 }
fn default_health_interval_ms() -> u64 { 30_000 }
fn default_virtual_nodes() -> usize { 160 }
fn default_cache_namespace() -> String { "app".to_string() }
fn default_cache_ttl_secs() -> u64 { 300 }
fn default_sweep_interval_ms() -> u64 { 60_000 }
fn default_max_local_entries() -> usize { 10_000 }
fn default_invalidation_channel() -> String { "cache:invalidate".to_string() }
fn default_resubscribe_ms() -> u64 { 5_000 }
fn default_rate_limit_prefix() -> String { "rl".to_string() }
fn default_rate_limit() -> u64 { 100 }
fn default_rate_window_ms() -> u64 { 60_000 }
fn default_lock_prefix() -> String { "lock".to_string() }
fn default_lock_ttl_ms() -> u64 { 10_000 }
fn default_slow_threshold_ms() -> u64 { 1_000 }
fn default_max_samples() -> usize { 1_000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = CoordinationConfig::default();
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.cooldown_ms, 30_000);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.partitioning.virtual_nodes, 160);
        assert_eq!(config.cache.max_local_entries, 10_000);
        assert_eq!(config.lock.default_ttl_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: CoordinationConfig = serde_json::from_value(serde_json::json!({
            "backend": { "topology": "cluster", "nodes": ["redis://a:6379", "redis://b:6379"] },
            "concurrency": { "limits": { "email": 2 } }
        }))
        .unwrap();

        assert_eq!(config.backend.topology, Topology::Cluster);
        assert_eq!(config.backend.nodes.len(), 2);
        assert_eq!(config.concurrency.limits.get("email"), Some(&2));
        // Untouched sections keep their defaults
        assert_eq!(config.cache.namespace, "app");
        assert_eq!(config.backend.command_timeout_ms, 2_000);
    }

    #[test]
    fn test_validate_rejects_empty_cluster() {
        let mut config = CoordinationConfig::default();
        config.backend.topology = Topology::Cluster;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backend.nodes"));
    }

    #[test]
    fn test_validate_requires_sentinel_master() {
        let mut config = CoordinationConfig::default();
        config.backend.topology = Topology::Sentinel;
        config.backend.nodes = vec!["redis://sentinel:26379".into()];
        assert!(config.validate().is_err());

        config.backend.sentinel_master = Some("primary".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = CoordinationConfig::default();
        config.concurrency.limits.insert("export".into(), 0);
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.circuit.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let cases: [(&str, fn(&mut CoordinationConfig)); 4] = [
            ("health.interval_ms", |c| c.health.interval_ms = 0),
            ("cache.sweep_interval_ms", |c| c.cache.sweep_interval_ms = 0),
            ("cache.resubscribe_ms", |c| c.cache.resubscribe_ms = 0),
            ("rate_limit.cleanup_interval_ms", |c| c.rate_limit.cleanup_interval_ms = 0),
        ];
        for (expected, zero) in cases {
            let mut config = CoordinationConfig::default();
            zero(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
                other => panic!("{} = 0 accepted: {:?}", expected, other),
            }
        }
        assert!(CoordinationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_ring_nodes_fallback() {
        let config = CoordinationConfig::default();
        assert_eq!(config.ring_nodes(), vec!["redis://127.0.0.1:6379".to_string()]);

        let mut config = CoordinationConfig::default();
        config.partitioning.nodes = vec!["n1".into(), "n2".into()];
        assert_eq!(config.ring_nodes().len(), 2);
    }
}
