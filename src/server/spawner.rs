// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks: the peer HTTP
//! API, the embedded SSH server, and the tick loops for the backup,
//! replication, failover, health, and SSH-identity subsystems.

use super::context::ServerContext;
use super::http;
use super::metrics_server;
use crate::core::dataset::CliZeltaDataset;
use crate::core::guest::CliGuestLifecycle;
use crate::core::ssh_server::{ClusterSshServer, ClusterSshServerConfig};
use crate::core::tasks::{
    BackupDrainWorker, BackupMaintenanceTask, BackupTickTask, FailoverTickTask, HealthTickTask,
    ReplicationDrainWorker, ReplicationTickTask, SshIdentityReconcileTask,
};
use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let shutdown_tx = ctx.shutdown_tx.clone();

    let http_state = Arc::new(http::HttpState {
        raft: ctx.raft.clone(),
        router: ctx.router.clone(),
        storage: ctx.storage.clone(),
        jwt: ctx.jwt.clone(),
        failover: ctx.failover_controller.clone(),
        cluster_key: ctx.config.cluster_key.clone(),
        hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".into()),
        local_pool: ctx.config.zfs_pool.clone(),
        sysinfo: tokio::sync::Mutex::new(sysinfo::System::new_all()),
    });
    let http_addr: SocketAddr = (
        ctx.config.host.parse::<std::net::IpAddr>().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into()),
        ctx.config.port,
    )
        .into();
    let http_rx = shutdown_tx.subscribe();

    ctx.background_tasks.spawn(run_http_server(http_state, http_addr, http_rx));

    if ctx.config.metrics.enabled {
        let metrics_port = ctx.config.metrics.port;
        let metrics_rx = shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_port, metrics_rx).await;
            Ok(())
        });
    }

    let host_key = load_or_generate_host_key(&ctx.config.ssh_host_key_path)?;
    let ssh_cfg = ClusterSshServerConfig {
        bind_port: ctx.config.ssh_port,
        host_key,
        local_node_uuid: ctx.config.node_uuid,
        storage: ctx.storage.clone(),
        router: ctx.router.clone(),
    };
    let background_tasks = &mut ctx.background_tasks;
    background_tasks.spawn(async move {
        ClusterSshServer::run(ssh_cfg).await.map_err(|e| anyhow!("embedded ssh server exited: {e}"))
    });

    let backup_tick = BackupTickTask::new(ctx.backup_scheduler.clone());
    let rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        backup_tick.run(rx).await;
        Ok(())
    });

    let backup_maintenance = BackupMaintenanceTask::new(ctx.backup_scheduler.clone());
    let rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        backup_maintenance.run(rx).await;
        Ok(())
    });

    let backup_drain = BackupDrainWorker::new(ctx.backup_scheduler.clone());
    let rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        backup_drain.run(rx).await;
        Ok(())
    });

    let replication_tick = ReplicationTickTask::new(ctx.replication_scheduler.clone());
    let rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        replication_tick.run(rx).await;
        Ok(())
    });

    let replication_drain = ReplicationDrainWorker::new(ctx.replication_scheduler.clone());
    let rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        replication_drain.run(rx).await;
        Ok(())
    });

    let failover_tick = FailoverTickTask::new(ctx.failover_controller.clone());
    let rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        failover_tick.run(rx).await;
        Ok(())
    });

    let health_tick = HealthTickTask::new(ctx.health_reconciler.clone());
    let rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        health_tick.run(rx).await;
        Ok(())
    });

    let ssh_identity_tick = SshIdentityReconcileTask::new(ctx.storage.clone(), ctx.config.ssh_authorized_keys_path.clone());
    let rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        ssh_identity_tick.run(rx).await;
        Ok(())
    });

    info!("All background tasks have been spawned.");
    Ok(())
}

async fn run_http_server(
    state: Arc<http::HttpState<CliZeltaDataset, CliGuestLifecycle>>,
    addr: SocketAddr,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> Result<()> {
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("peer HTTP API listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("peer HTTP API shutting down");
        })
        .await
        .map_err(|e| anyhow!("peer http server failed: {e}"))
}

/// Loads the embedded SSH server's persistent host key, generating and
/// saving a fresh Ed25519 key on first boot.
fn load_or_generate_host_key(path: &std::path::Path) -> Result<russh_keys::key::KeyPair> {
    if let Ok(bytes) = std::fs::read(path) {
        if let Ok(key) = russh_keys::decode_secret_key(&String::from_utf8_lossy(&bytes), None) {
            return Ok(key);
        }
        error!(path = %path.display(), "existing ssh host key unreadable; regenerating");
    }
    let key = russh_keys::key::KeyPair::generate_ed25519().ok_or_else(|| anyhow!("ed25519 key generation failed"))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, russh_keys::encode_pkcs8_pem(&key)?)?;
    Ok(key)
}
