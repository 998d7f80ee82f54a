// src/core/tasks/ssh_identity_tick.rs

//! Keeps the local `authorized_keys` file in sync with the Raft-replicated
//! `ClusterSshIdentity` registry, so a newly joined peer's key becomes
//! usable for inbound backup/replication pushes without a restart.

use crate::core::raft::storage::SqliteRaftStorage;
use crate::core::ssh_server::authorized_keys;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

pub struct SshIdentityReconcileTask {
    storage: Arc<SqliteRaftStorage>,
    authorized_keys_path: PathBuf,
}

impl SshIdentityReconcileTask {
    pub fn new(storage: Arc<SqliteRaftStorage>, authorized_keys_path: PathBuf) -> Self {
        Self {
            storage,
            authorized_keys_path,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("authorized_keys reconciler started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sm = self.storage.state_machine_snapshot().await;
                    let identities: Vec<_> = sm.cluster_ssh_identities.values().cloned().collect();
                    if let Err(e) = authorized_keys::reconcile(&self.authorized_keys_path, &identities) {
                        error!(error = %e, "authorized_keys reconciliation failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("authorized_keys reconciler shutting down");
                    return;
                }
            }
        }
    }
}
