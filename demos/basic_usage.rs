// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic coord-engine usage example.
//!
//! Demonstrates:
//! 1. Starting a coordinator (Redis if `REDIS_URL` is set, in-memory otherwise)
//! 2. Cache reads/writes, JSON helpers and pattern invalidation
//! 3. Rate limiting a login route by client IP
//! 4. A distributed lock around a critical section
//! 5. Per-job-type concurrency limits
//! 6. Consistent-hash placement
//! 7. Health report and raw metrics
//! 8. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use coord_engine::cache::list_key;
use coord_engine::{
    Coordinator, CoordinationConfig, KeyStrategy, MemoryBackend, RateLimitOptions, RequestIdentity,
};

#[derive(Debug, Serialize, Deserialize)]
struct Profile {
    name: String,
    role: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coord_engine=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           coord-engine: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start
    // ─────────────────────────────────────────────────────────────────────────
    let mut config = CoordinationConfig::default();
    config.cache.namespace = "demo".into();
    config.concurrency.limits.insert("thumbnail".into(), 2);

    let coordinator = match std::env::var("REDIS_URL") {
        Ok(url) => {
            println!("📦 Using Redis at {}", url);
            config.backend.url = url;
            Coordinator::new(config)?
        }
        Err(_) => {
            println!("📦 REDIS_URL not set; using the in-memory backend");
            Coordinator::with_connector(config, Arc::new(MemoryBackend::new()))?
        }
    };

    println!("   State: {}", coordinator.state());
    coordinator.start().await;
    println!("   ✅ Running (healthy: {})", coordinator.connection().is_healthy());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Cache
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Cache");
    let cache = coordinator.cache();
    let alice = Profile { name: "Alice".into(), role: "admin".into() };
    cache.set_json("user:alice", &alice, None).await?;
    let loaded: Option<Profile> = cache.get_json("user:alice").await?;
    println!("   └─ user:alice → {:?}", loaded);

    let query = serde_json::json!({ "role": "admin", "page": 1 });
    let key = list_key("user", &query)?;
    let page = cache
        .get_or_set(&key, Some(Duration::from_secs(30)), || async {
            Ok::<_, coord_engine::CacheError>(b"[\"alice\"]".to_vec())
        })
        .await?;
    println!("   └─ {} → {}", key, String::from_utf8_lossy(&page));

    let removed = cache.invalidate_pattern("user:*").await?;
    println!("   └─ invalidate_pattern('user:*') removed {} keys", removed);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Rate limiting
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚦 Rate limiting (3 logins per minute per IP)");
    let options = RateLimitOptions::new(3, Duration::from_secs(60)).with_key_strategy(KeyStrategy::Ip);
    let request = RequestIdentity::new()
        .with_header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
        .with_remote_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    for attempt in 1..=4 {
        let verdict = coordinator.rate_limiter().check_request("login", &options, &request).await;
        println!(
            "   └─ attempt {}: allowed={} remaining={} retry_after={:?}",
            attempt, verdict.allowed, verdict.remaining, verdict.retry_after_seconds
        );
        if !verdict.allowed {
            for (name, value) in verdict.headers() {
                println!("      {}: {}", name, value);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Distributed lock
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔐 Lock");
    let outcome = coordinator
        .lock()
        .with_lock("report:daily", Some(Duration::from_secs(5)), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            "report generated"
        })
        .await;
    match outcome {
        Some(result) => println!("   └─ {}", result),
        None => println!("   └─ lock not acquired (held elsewhere or backend unavailable)"),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Concurrency control
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⚙️  Concurrency (thumbnail max 2)");
    let mut jobs = Vec::new();
    for i in 0..5 {
        let concurrency = coordinator.concurrency().clone();
        let monitor = Arc::clone(coordinator.monitor());
        jobs.push(tokio::spawn(async move {
            concurrency
                .run("thumbnail", async {
                    let timer = monitor.start("thumbnail.render");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    timer.finish(true);
                    i
                })
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
    println!("   └─ in flight: {:?}", coordinator.concurrency().get_status()["thumbnail"]);
    for job in jobs {
        job.await??;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Partitioning
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🧭 Partitioning");
    let nodes: Vec<String> = (1..=3).map(|i| format!("redis://cache-{}:6379", i)).collect();
    let ring = coord_engine::PartitioningStrategy::new(&nodes, 160);
    let keys: Vec<String> = (0..9).map(|i| format!("session:{}", i)).collect();
    for (node, owned) in ring.distribute_keys(&keys) {
        println!("   └─ {} ← {} keys", node, owned.len());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Health report:");
    let report = coordinator.health_report().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 8. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    coordinator.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", coordinator.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print every captured metric, grouped by kind.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<(String, String)> = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => format!("counter {}", v),
            DebugValue::Gauge(v) => format!("gauge {:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                format!("histogram count={} avg={:.4}", count, avg)
            }
        };
        lines.push((format!("{}{}", key.name(), label_str), rendered));
    }
    lines.sort();
    for (name, value) in lines {
        println!("   └─ {} = {}", name, value);
    }
}
