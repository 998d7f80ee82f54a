// src/server/http.rs

//! The peer-facing HTTP API (mutual-trust, cluster-JWT authenticated):
//! node vitals used by the health reconciler, the Raft RPC surface used by
//! `HttpRaftNetwork`, and the cluster-internal SSH-identity/activate
//! endpoints used by the replication and failover engines.

use crate::core::capability::GuestLifecycle;
use crate::core::dataset::Dataset;
use crate::core::failover::FailoverController;
use crate::core::jwt::ClusterJwt;
use crate::core::model::{ClusterSshIdentity, GuestType};
use crate::core::raft::command::{ClusterSshIdentityAction, Command};
use crate::core::raft::router::{CommandRouter, FleetRaft};
use crate::core::raft::storage::SqliteRaftStorage;
use async_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteRequest, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

pub struct HttpState<D: Dataset, G: GuestLifecycle> {
    pub raft: Arc<FleetRaft>,
    pub router: Arc<CommandRouter>,
    pub storage: Arc<SqliteRaftStorage>,
    pub jwt: Arc<ClusterJwt>,
    pub failover: Arc<FailoverController<D, G>>,
    pub cluster_key: String,
    pub hostname: String,
    pub local_pool: String,
    pub sysinfo: AsyncMutex<System>,
}

pub fn router<D: Dataset + 'static, G: GuestLifecycle + 'static>(state: Arc<HttpState<D, G>>) -> Router {
    let peer_api = Router::new()
        .route("/api/info/cpu", get(info_cpu::<D, G>))
        .route("/api/info/ram", get(info_ram::<D, G>))
        .route("/api/zfs/pools/disks-usage", get(disks_usage::<D, G>))
        .route("/api/jail/simple", get(jail_simple::<D, G>))
        .route("/api/vm/simple", get(vm_simple::<D, G>))
        .route("/api/health/basic", post(health_basic::<D, G>))
        .route("/api/cluster/replication/internal/ssh-identity", post(ssh_identity::<D, G>))
        .route("/api/cluster/replication/internal/activate", post(activate::<D, G>))
        .layer(middleware::from_fn_with_state(state.clone(), require_cluster_token::<D, G>));

    let raft_rpc = Router::new()
        .route("/internal/raft/append-entries", post(raft_append_entries::<D, G>))
        .route("/internal/raft/install-snapshot", post(raft_install_snapshot::<D, G>))
        .route("/internal/raft/vote", post(raft_vote::<D, G>))
        .route("/internal/raft/client-write", post(raft_client_write::<D, G>));

    Router::new().merge(peer_api).merge(raft_rpc).with_state(state)
}

async fn require_cluster_token<D: Dataset, G: GuestLifecycle>(
    State(state): State<Arc<HttpState<D, G>>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let token = headers
        .get("X-Cluster-Token")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token.and_then(|t| state.jwt.verify(t).ok()) {
        Some(_node_uuid) => next.run(request).await,
        None => {
            warn!("rejected peer API request: missing or invalid cluster token");
            (StatusCode::UNAUTHORIZED, "invalid cluster token").into_response()
        }
    }
}

#[derive(Serialize)]
struct CpuInfoResponse {
    hostname: String,
    count: u32,
    usage_pct: f64,
}

async fn info_cpu<D: Dataset, G: GuestLifecycle>(State(state): State<Arc<HttpState<D, G>>>) -> Json<CpuInfoResponse> {
    let mut sys = state.sysinfo.lock().await;
    sys.refresh_cpu_usage();
    let count = sys.cpus().len() as u32;
    let usage_pct = if count > 0 {
        sys.cpus().iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / count as f64
    } else {
        0.0
    };
    Json(CpuInfoResponse {
        hostname: state.hostname.clone(),
        count,
        usage_pct,
    })
}

#[derive(Serialize)]
struct RamInfoResponse {
    used_bytes: u64,
    used_pct: f64,
}

async fn info_ram<D: Dataset, G: GuestLifecycle>(State(state): State<Arc<HttpState<D, G>>>) -> Json<RamInfoResponse> {
    let mut sys = state.sysinfo.lock().await;
    sys.refresh_memory();
    let total = sys.total_memory().max(1);
    let used = sys.used_memory();
    Json(RamInfoResponse {
        used_bytes: used,
        used_pct: used as f64 / total as f64 * 100.0,
    })
}

#[derive(Serialize)]
struct DiskUsageResponse {
    used_bytes: u64,
    used_pct: f64,
}

/// Shells out to `zfs list` for the configured pool, matching the
/// dataset/backup subsystem's convention of driving ZFS through a
/// subprocess rather than a native binding.
async fn disks_usage<D: Dataset, G: GuestLifecycle>(
    State(state): State<Arc<HttpState<D, G>>>,
) -> Result<Json<DiskUsageResponse>, (StatusCode, String)> {
    let output = tokio::process::Command::new("zfs")
        .args(["list", "-Hp", "-o", "used,available", &state.local_pool])
        .output()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut fields = stdout.trim().split('\t');
    let used: u64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let avail: u64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let total = (used + avail).max(1);

    Ok(Json(DiskUsageResponse {
        used_bytes: used,
        used_pct: used as f64 / total as f64 * 100.0,
    }))
}

#[derive(Serialize)]
struct SimpleGuest {
    #[serde(skip_serializing_if = "Option::is_none")]
    ct_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rid: Option<u64>,
}

#[derive(Serialize)]
struct SimpleListResponse {
    status: &'static str,
    data: Vec<SimpleGuest>,
}

/// Guests this node currently owns (source or active) per the replicated
/// replication policies, rather than a raw on-disk enumeration: the set of
/// guests a node "has" for health-reporting purposes is exactly the set it
/// is responsible for, which is already tracked in Raft.
async fn guests_owned_here<D: Dataset, G: GuestLifecycle>(
    state: &Arc<HttpState<D, G>>,
    guest_type: GuestType,
) -> Vec<u64> {
    let sm = state.storage.state_machine_snapshot().await;
    let local = state.failover.local_node_id();
    sm.replication_policies
        .values()
        .filter(|p| p.guest_type == guest_type)
        .filter(|p| p.source_node_id == Some(local) || p.active_node_id == Some(local))
        .map(|p| p.guest_id)
        .collect()
}

async fn jail_simple<D: Dataset, G: GuestLifecycle>(State(state): State<Arc<HttpState<D, G>>>) -> Json<SimpleListResponse> {
    let ids = guests_owned_here(&state, GuestType::Jail).await;
    Json(SimpleListResponse {
        status: "success",
        data: ids.into_iter().map(|id| SimpleGuest { ct_id: Some(id), rid: None }).collect(),
    })
}

async fn vm_simple<D: Dataset, G: GuestLifecycle>(State(state): State<Arc<HttpState<D, G>>>) -> Json<SimpleListResponse> {
    let ids = guests_owned_here(&state, GuestType::Vm).await;
    Json(SimpleListResponse {
        status: "success",
        data: ids.into_iter().map(|id| SimpleGuest { ct_id: None, rid: Some(id) }).collect(),
    })
}

#[derive(Deserialize)]
struct HealthBasicRequest {
    #[serde(rename = "clusterKey")]
    cluster_key: String,
}

async fn health_basic<D: Dataset, G: GuestLifecycle>(
    State(state): State<Arc<HttpState<D, G>>>,
    Json(req): Json<HealthBasicRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if req.cluster_key != state.cluster_key {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(Json(json!({ "status": "success", "data": { "hostname": state.hostname } })))
}

async fn ssh_identity<D: Dataset, G: GuestLifecycle>(
    State(state): State<Arc<HttpState<D, G>>>,
    Json(identity): Json<ClusterSshIdentity>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .router
        .apply(Command::ClusterSshIdentity(ClusterSshIdentityAction::Upsert(identity)))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ActivateRequest {
    #[serde(rename = "policyId", alias = "policy_id")]
    policy_id: i64,
}

async fn activate<D: Dataset, G: GuestLifecycle>(
    State(state): State<Arc<HttpState<D, G>>>,
    Json(req): Json<ActivateRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .failover
        .activate_by_policy_id(req.policy_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn raft_append_entries<D: Dataset, G: GuestLifecycle>(
    State(state): State<Arc<HttpState<D, G>>>,
    Json(rpc): Json<AppendEntriesRequest<Command>>,
) -> Result<Json<AppendEntriesResponse>, (StatusCode, String)> {
    state
        .raft
        .append_entries(rpc)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn raft_install_snapshot<D: Dataset, G: GuestLifecycle>(
    State(state): State<Arc<HttpState<D, G>>>,
    Json(rpc): Json<InstallSnapshotRequest>,
) -> Result<Json<InstallSnapshotResponse>, (StatusCode, String)> {
    state
        .raft
        .install_snapshot(rpc)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn raft_vote<D: Dataset, G: GuestLifecycle>(
    State(state): State<Arc<HttpState<D, G>>>,
    Json(rpc): Json<VoteRequest>,
) -> Result<Json<VoteResponse>, (StatusCode, String)> {
    state
        .raft
        .vote(rpc)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn raft_client_write<D: Dataset, G: GuestLifecycle>(
    State(state): State<Arc<HttpState<D, G>>>,
    Json(cmd): Json<Command>,
) -> Result<Json<crate::core::raft::command::CommandResponse>, (StatusCode, String)> {
    state
        .raft
        .client_write(ClientWriteRequest::new(cmd))
        .await
        .map(|resp| Json(resp.data))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

