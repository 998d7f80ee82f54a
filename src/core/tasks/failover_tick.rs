// src/core/tasks/failover_tick.rs

//! The leader-only failover controller tick (component G): renews leases
//! for online guest owners and activates a new owner after three
//! consecutive misses.

use crate::core::capability::GuestLifecycle;
use crate::core::dataset::Dataset;
use crate::core::failover::FailoverController;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

const TICK_INTERVAL: Duration = Duration::from_secs(3);

pub struct FailoverTickTask<D: Dataset, G: GuestLifecycle> {
    controller: Arc<FailoverController<D, G>>,
}

impl<D: Dataset, G: GuestLifecycle> FailoverTickTask<D, G> {
    pub fn new(controller: Arc<FailoverController<D, G>>) -> Self {
        Self { controller }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("failover controller tick started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.controller.tick().await {
                        error!(error = %e, "failover controller tick failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("failover controller tick shutting down");
                    return;
                }
            }
        }
    }
}
