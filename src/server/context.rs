// src/server/context.rs

use crate::config::Config;
use crate::core::backup::BackupScheduler;
use crate::core::dataset::CliZeltaDataset;
use crate::core::failover::FailoverController;
use crate::core::guest::{CliGuestLifecycle, CliGuestMetadataBuilder, CliNetworkSync};
use crate::core::health::{HealthReconciler, HttpPeerInfoSource};
use crate::core::jwt::ClusterJwt;
use crate::core::local_db::LocalDb;
use crate::core::queue::DurableQueue;
use crate::core::raft::network::PeerRegistry;
use crate::core::raft::router::{CommandRouter, FleetRaft};
use crate::core::raft::storage::SqliteRaftStorage;
use crate::core::replication::ReplicationScheduler;
use crate::core::restore::RestoreEngine;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds every long-lived handle the spawned background tasks and the
/// peer HTTP API need; built once in `initialization::setup`.
pub struct ServerContext {
    pub config: Config,
    pub storage: Arc<SqliteRaftStorage>,
    pub raft: Arc<FleetRaft>,
    pub router: Arc<CommandRouter>,
    pub peers: PeerRegistry,
    pub local_db: Arc<LocalDb>,
    pub queue: Arc<DurableQueue>,
    pub jwt: Arc<ClusterJwt>,
    pub dataset: Arc<CliZeltaDataset>,
    pub guests: Arc<CliGuestLifecycle>,
    pub backup_scheduler: Arc<BackupScheduler<CliZeltaDataset, CliGuestLifecycle>>,
    pub replication_scheduler: Arc<ReplicationScheduler<CliZeltaDataset, CliGuestLifecycle>>,
    pub failover_controller: Arc<FailoverController<CliZeltaDataset, CliGuestLifecycle>>,
    pub health_reconciler: Arc<HealthReconciler<HttpPeerInfoSource>>,
    pub restore_engine: Arc<RestoreEngine<CliZeltaDataset, CliGuestMetadataBuilder, CliNetworkSync>>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
