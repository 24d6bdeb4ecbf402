// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Passive latency/outcome sink.
//!
//! Keeps totals plus a bounded window of recent samples per operation name,
//! for the health endpoint. Every sample is also forwarded to the `metrics`
//! facade. Samples at or above the slow threshold are logged.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::config::MonitorSettings;

const COMPONENT: &str = "monitor";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    /// Over the retained sample window only
    pub p95_ms: f64,
}

#[derive(Debug, Default)]
struct Samples {
    count: u64,
    errors: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    recent: VecDeque<Duration>,
}

impl Samples {
    fn push(&mut self, duration: Duration, success: bool, max_samples: usize) {
        self.count += 1;
        if !success {
            self.errors += 1;
        }
        self.total += duration;
        self.min = Some(self.min.map_or(duration, |m| m.min(duration)));
        self.max = self.max.max(duration);
        if max_samples > 0 {
            if self.recent.len() == max_samples {
                self.recent.pop_front();
            }
            self.recent.push_back(duration);
        }
    }

    fn stats(&self) -> OperationStats {
        let ms = |d: Duration| d.as_micros() as f64 / 1_000.0;
        let mut sorted: Vec<Duration> = self.recent.iter().copied().collect();
        sorted.sort_unstable();
        let p95 = if sorted.is_empty() {
            Duration::ZERO
        } else {
            let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
            sorted[rank.clamp(1, sorted.len()) - 1]
        };
        OperationStats {
            count: self.count,
            errors: self.errors,
            min_ms: ms(self.min.unwrap_or_default()),
            avg_ms: if self.count == 0 { 0.0 } else { ms(self.total) / self.count as f64 },
            max_ms: ms(self.max),
            p95_ms: ms(p95),
        }
    }
}

pub struct PerformanceMonitor {
    operations: DashMap<String, Samples>,
    slow_threshold: Duration,
    max_samples: usize,
}

impl PerformanceMonitor {
    #[must_use]
    pub fn new(settings: &MonitorSettings) -> Self {
        Self {
            operations: DashMap::new(),
            slow_threshold: settings.slow_threshold(),
            max_samples: settings.max_samples,
        }
    }

    pub fn record(&self, operation: &str, duration: Duration, success: bool) {
        if duration >= self.slow_threshold {
            warn!(
                operation = %operation,
                duration_ms = duration.as_millis() as u64,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "Slow operation"
            );
        }
        self.operations
            .entry(operation.to_string())
            .or_default()
            .push(duration, success, self.max_samples);

        crate::metrics::record_latency(COMPONENT, operation, duration);
        crate::metrics::record_operation(COMPONENT, operation, if success { "success" } else { "error" });
    }

    /// Start timing `operation`. Dropping the timer without
    /// [`finish`](OperationTimer::finish) records an error.
    pub fn start<'a>(&'a self, operation: &'a str) -> OperationTimer<'a> {
        OperationTimer {
            monitor: self,
            operation,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Time a fallible future; `Err` counts as an error.
    pub async fn measure<F, T, E>(&self, operation: &str, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let timer = self.start(operation);
        let result = work.await;
        timer.finish(result.is_ok());
        result
    }

    #[must_use]
    pub fn get_stats(&self) -> BTreeMap<String, OperationStats> {
        self.operations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    #[must_use]
    pub fn get_operation_stats(&self, operation: &str) -> Option<OperationStats> {
        self.operations.get(operation).map(|s| s.stats())
    }

    pub fn reset(&self) {
        self.operations.clear();
    }
}

pub struct OperationTimer<'a> {
    monitor: &'a PerformanceMonitor,
    operation: &'a str,
    started: Instant,
    finished: bool,
}

impl OperationTimer<'_> {
    pub fn finish(mut self, success: bool) {
        self.finished = true;
        self.monitor.record(self.operation, self.started.elapsed(), success);
    }
}

impl Drop for OperationTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.monitor.record(self.operation, self.started.elapsed(), false);
        }
    }
}
