// src/server/initialization.rs

//! Builds every long-lived handle the node needs before its background
//! tasks and peer HTTP API can start: Raft storage/transport, the local
//! SQLite store and durable queue, and the backup/replication/failover/
//! health engines wired against the production `Dataset`/`GuestLifecycle`
//! capability implementations.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::backup::{BackupExecutor, BackupScheduler};
use crate::core::dataset::CliZeltaDataset;
use crate::core::failover::FailoverController;
use crate::core::guest::{CliGuestLifecycle, CliGuestMetadataBuilder, CliNetworkSync};
use crate::core::health::{ClusterMember, HealthReconciler, HttpPeerInfoSource};
use crate::core::jwt::ClusterJwt;
use crate::core::local_db::LocalDb;
use crate::core::queue::DurableQueue;
use crate::core::raft::network::{HttpRaftNetwork, PeerRegistry};
use crate::core::raft::router::CommandRouter;
use crate::core::raft::storage::SqliteRaftStorage;
use crate::core::replication::run::ReplicationRunner;
use crate::core::replication::scheduler::ReplicationScheduler;
use crate::core::restore::RestoreEngine;
use anyhow::{anyhow, Result};
use async_raft::Raft;
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

pub async fn setup(
    config: Config,
    _log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let peers = PeerRegistry::new();
    for peer in &config.peers {
        peers.set(peer.raft_node_id, peer.api_endpoint.clone());
    }

    let storage = Arc::new(SqliteRaftStorage::open(
        config.raft_node_id,
        &config.raft_db_path(),
        config.raft_snapshot_dir(),
    )?);

    let network = Arc::new(HttpRaftNetwork::new(peers.clone()));
    let raft_config = Arc::new(
        async_raft::Config::build("fleetkeeper-cluster".into())
            .validate()
            .map_err(|e| anyhow!("invalid raft config: {e}"))?,
    );
    let raft = Arc::new(Raft::new(config.raft_node_id, raft_config, network, storage.clone()));
    let router = Arc::new(CommandRouter::new(config.raft_node_id, raft.clone(), peers.clone()));

    let local_db = Arc::new(LocalDb::open(&config.local_db_path())?);
    let queue_conn = Connection::open(config.local_db_path())?;
    let queue = Arc::new(DurableQueue::new(queue_conn));

    let jwt = Arc::new(ClusterJwt::new(config.cluster_key.as_bytes().to_vec()));

    let dataset = Arc::new(CliZeltaDataset::default());
    let guests = Arc::new(CliGuestLifecycle::default());
    let metadata_builder = Arc::new(CliGuestMetadataBuilder::new(
        config.data_dir.join("jail.conf.d"),
        config.data_dir.join("vm.conf.d"),
    ));
    let network_sync = Arc::new(CliNetworkSync::default());

    let executor = Arc::new(BackupExecutor::new(dataset.clone(), guests.clone(), local_db.clone()));
    let backup_scheduler = Arc::new(BackupScheduler::new(
        config.node_uuid,
        storage.clone(),
        router.clone(),
        queue.clone(),
        local_db.clone(),
        executor,
    ));

    let replication_runner = Arc::new(ReplicationRunner::new(
        dataset.clone(),
        router.clone(),
        storage.clone(),
        config.node_uuid,
    ));
    let local_identity = crate::core::model::ClusterSshIdentity {
        node_uuid: config.node_uuid,
        ssh_user: "root".into(),
        ssh_host: config.host.clone(),
        ssh_port: config.ssh_port,
        public_key: String::new(),
    };
    let replication_scheduler = Arc::new(ReplicationScheduler::new(
        config.node_uuid,
        config.zfs_pool.clone(),
        storage.clone(),
        router.clone(),
        queue.clone(),
        guests.clone(),
        replication_runner,
        local_identity,
        config.ssh_authorized_keys_path.to_string_lossy().into_owned(),
    ));

    let failover_controller = Arc::new(FailoverController::new(
        config.node_uuid,
        dataset.clone(),
        guests.clone(),
        storage.clone(),
        router.clone(),
        jwt.clone(),
    ));

    let health_directory: std::collections::HashMap<async_raft::NodeId, ClusterMember> = config
        .peers
        .iter()
        .map(|p| {
            (
                p.raft_node_id,
                ClusterMember {
                    uuid: p.uuid,
                    api_endpoint: p.api_endpoint.clone(),
                },
            )
        })
        .collect();
    let health_reconciler = Arc::new(HealthReconciler::new(
        health_directory,
        raft.clone(),
        Arc::new(HttpPeerInfoSource::new(config.cluster_key.clone(), config.node_uuid)),
        storage.clone(),
        router.clone(),
    ));

    let restore_engine = Arc::new(RestoreEngine::new(dataset.clone(), metadata_builder, network_sync));

    Ok(ServerContext {
        config,
        storage,
        raft,
        router,
        peers,
        local_db,
        queue,
        jwt,
        dataset,
        guests,
        backup_scheduler,
        replication_scheduler,
        failover_controller,
        health_reconciler,
        restore_engine,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

fn log_startup_info(config: &Config) {
    info!(
        node_uuid = %config.node_uuid,
        raft_node_id = config.raft_node_id,
        zfs_pool = %config.zfs_pool,
        peer_count = config.peers.len(),
        "starting fleetkeeper node"
    );
}
