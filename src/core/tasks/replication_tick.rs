// src/core/tasks/replication_tick.rs

//! Background loops wrapping the HA replication scheduler: a 5 s tick that
//! self-fences, renews this node's SSH identity, and enqueues due policies,
//! plus a worker that drains pushes onto peer nodes.

use crate::core::capability::GuestLifecycle;
use crate::core::dataset::Dataset;
use crate::core::replication::ReplicationScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const TICK_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_IDLE_BACKOFF: Duration = Duration::from_millis(500);

pub struct ReplicationTickTask<D: Dataset, G: GuestLifecycle> {
    scheduler: Arc<ReplicationScheduler<D, G>>,
}

impl<D: Dataset, G: GuestLifecycle> ReplicationTickTask<D, G> {
    pub fn new(scheduler: Arc<ReplicationScheduler<D, G>>) -> Self {
        Self { scheduler }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("replication scheduler tick started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scheduler.tick().await {
                        error!(error = %e, "replication scheduler tick failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("replication scheduler tick shutting down");
                    return;
                }
            }
        }
    }
}

pub struct ReplicationDrainWorker<D: Dataset, G: GuestLifecycle> {
    scheduler: Arc<ReplicationScheduler<D, G>>,
}

impl<D: Dataset, G: GuestLifecycle> ReplicationDrainWorker<D, G> {
    pub fn new(scheduler: Arc<ReplicationScheduler<D, G>>) -> Self {
        Self { scheduler }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("replication drain worker started");
        loop {
            tokio::select! {
                result = self.scheduler.drain_one() => {
                    match result {
                        Ok(true) => continue,
                        Ok(false) => tokio::time::sleep(DRAIN_IDLE_BACKOFF).await,
                        Err(e) => {
                            error!(error = %e, "replication drain worker failed");
                            tokio::time::sleep(DRAIN_IDLE_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("replication drain worker shutting down");
                    return;
                }
            }
        }
    }
}
