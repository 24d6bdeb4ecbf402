// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coordinator startup and shutdown.

use tokio::time::Instant;
use tracing::info;

use super::{Coordinator, EngineState};

impl Coordinator {
    fn set_state(&self, next: EngineState) {
        self.state.send_replace(next);
        crate::metrics::set_engine_state(&next.to_string());
    }

    /// Connect to the backend and start every background task.
    ///
    /// Does not fail: an unreachable backend leaves the coordinator running
    /// in degraded mode with reconnection scheduled.
    #[tracing::instrument(skip(self), fields(topology = %self.config.backend.topology))]
    pub async fn start(&self) {
        if self.state() != EngineState::Created {
            return;
        }
        let started = Instant::now();
        self.set_state(EngineState::Starting);
        info!("Starting coordination layer");

        self.connection.initialize().await;
        self.cache.start().await;
        self.rate_limiter.start();

        self.set_state(EngineState::Running);
        crate::metrics::record_startup_total(started.elapsed());
        info!(
            healthy = self.connection.is_healthy(),
            ring_nodes = self.partitioning.ring().nodes().len(),
            "Coordination layer running"
        );
    }

    /// Stop background tasks and close the backend connection.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }
        self.set_state(EngineState::ShuttingDown);
        info!("Shutting down coordination layer");

        self.cache.stop();
        self.rate_limiter.stop();
        self.connection.shutdown().await;

        self.set_state(EngineState::Stopped);
        info!("Coordination layer stopped");
    }
}
