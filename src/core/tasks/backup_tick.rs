// src/core/tasks/backup_tick.rs

//! Background loops wrapping the ZFS backup engine's scheduler: a 30 s cron
//! evaluation tick, a 5-minute maintenance sweep, and a worker that drains
//! the durable run queue.

use crate::core::backup::scheduler::BackupScheduler;
use crate::core::capability::GuestLifecycle;
use crate::core::dataset::Dataset;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const TICK_INTERVAL: Duration = Duration::from_secs(30);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);
const DRAIN_IDLE_BACKOFF: Duration = Duration::from_millis(500);

pub struct BackupTickTask<D: Dataset, G: GuestLifecycle> {
    scheduler: Arc<BackupScheduler<D, G>>,
}

impl<D: Dataset, G: GuestLifecycle> BackupTickTask<D, G> {
    pub fn new(scheduler: Arc<BackupScheduler<D, G>>) -> Self {
        Self { scheduler }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("backup scheduler tick started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scheduler.tick().await {
                        error!(error = %e, "backup scheduler tick failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("backup scheduler tick shutting down");
                    return;
                }
            }
        }
    }
}

pub struct BackupMaintenanceTask<D: Dataset, G: GuestLifecycle> {
    scheduler: Arc<BackupScheduler<D, G>>,
}

impl<D: Dataset, G: GuestLifecycle> BackupMaintenanceTask<D, G> {
    pub fn new(scheduler: Arc<BackupScheduler<D, G>>) -> Self {
        Self { scheduler }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("backup maintenance tick started");
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scheduler.maintenance_tick().await {
                        error!(error = %e, "backup maintenance tick failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("backup maintenance tick shutting down");
                    return;
                }
            }
        }
    }
}

pub struct BackupDrainWorker<D: Dataset, G: GuestLifecycle> {
    scheduler: Arc<BackupScheduler<D, G>>,
}

impl<D: Dataset, G: GuestLifecycle> BackupDrainWorker<D, G> {
    pub fn new(scheduler: Arc<BackupScheduler<D, G>>) -> Self {
        Self { scheduler }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("backup drain worker started");
        loop {
            tokio::select! {
                result = self.scheduler.drain_one() => {
                    match result {
                        Ok(true) => continue,
                        Ok(false) => tokio::time::sleep(DRAIN_IDLE_BACKOFF).await,
                        Err(e) => {
                            error!(error = %e, "backup drain worker failed");
                            tokio::time::sleep(DRAIN_IDLE_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("backup drain worker shutting down");
                    return;
                }
            }
        }
    }
}
