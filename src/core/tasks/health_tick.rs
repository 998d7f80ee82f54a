// src/core/tasks/health_tick.rs

//! The node health reconciler tick (component B): polls every configured
//! cluster member and proposes `Node` upserts through Raft.

use crate::core::health::{HealthReconciler, PeerInfoSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

const TICK_INTERVAL: Duration = Duration::from_secs(10);

pub struct HealthTickTask<P: PeerInfoSource> {
    reconciler: Arc<HealthReconciler<P>>,
}

impl<P: PeerInfoSource> HealthTickTask<P> {
    pub fn new(reconciler: Arc<HealthReconciler<P>>) -> Self {
        Self { reconciler }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("node health reconciler tick started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconciler.tick().await {
                        error!(error = %e, "node health reconciler tick failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("node health reconciler tick shutting down");
                    return;
                }
            }
        }
    }
}
