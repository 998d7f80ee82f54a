// src/core/health/reconciler.rs

//! The node health reconciler (component B): every tick, polls each
//! configured cluster member's info endpoints, and proposes a `Node`
//! upsert through Raft only when the poll differs significantly from the
//! last persisted row. A member that stops answering is marked offline
//! rather than deleted; a member dropped from the configured membership
//! list entirely is deleted.

use crate::core::errors::FleetResult;
use crate::core::model::{Node, NodeStatus};
use crate::core::raft::command::{Command, NodeAction};
use crate::core::raft::router::{CommandRouter, FleetRaft};
use crate::core::raft::storage::SqliteRaftStorage;
use async_raft::NodeId;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_BASE_MS: u64 = 100;

/// A statically configured cluster peer, sourced from this node's config
/// file rather than Raft (Raft membership is keyed by `NodeId: u64`; the
/// business-level cluster objects are keyed by this `uuid`).
#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub uuid: Uuid,
    pub api_endpoint: String,
}

/// A peer's freshly polled vitals, before being wrapped into a `Node` row.
#[derive(Debug, Clone, Default)]
pub struct PeerSnapshot {
    pub hostname: String,
    pub cpu_count: u32,
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    pub mem_pct: f64,
    pub disk_bytes: u64,
    pub disk_pct: f64,
    pub guest_ids: BTreeSet<u64>,
}

#[async_trait]
pub trait PeerInfoSource: Send + Sync {
    async fn poll(&self, member: &ClusterMember) -> FleetResult<PeerSnapshot>;
}

/// Polls a peer's `/api/info/{cpu,ram}`, `/api/zfs/pools/disks-usage`, and
/// `/api/{jail,vm}/simple` endpoints and folds the responses into one
/// snapshot.
pub struct HttpPeerInfoSource {
    http: reqwest::Client,
    cluster_key: String,
    local_node_uuid: Uuid,
}

impl HttpPeerInfoSource {
    pub fn new(cluster_key: impl Into<String>, local_node_uuid: Uuid) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .danger_accept_invalid_certs(true)
                .build()
                .expect("building health-reconciler http client"),
            cluster_key: cluster_key.into(),
            local_node_uuid,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct HealthBasicRequest<'a> {
    #[serde(rename = "clusterKey")]
    cluster_key: &'a str,
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
struct CpuInfo {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    count: u32,
    #[serde(default)]
    usage_pct: f64,
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
struct RamInfo {
    #[serde(default)]
    used_bytes: u64,
    #[serde(default)]
    used_pct: f64,
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
struct DiskUsage {
    #[serde(default)]
    used_bytes: u64,
    #[serde(default)]
    used_pct: f64,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct JailSummary {
    #[serde(rename = "ctId")]
    ct_id: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct VmSummary {
    rid: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct SimpleListResponse<T> {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: Vec<T>,
}

#[async_trait]
impl PeerInfoSource for HttpPeerInfoSource {
    /// Issues every GET plus (for a non-local peer) the `/api/health/basic`
    /// liveness POST concurrently, then folds whichever succeeded into one
    /// snapshot.
    async fn poll(&self, member: &ClusterMember) -> FleetResult<PeerSnapshot> {
        let base = &member.api_endpoint;
        let is_local = member.uuid == self.local_node_uuid;

        let cpu_fut = self.http.get(format!("{base}/api/info/cpu")).send();
        let ram_fut = self.http.get(format!("{base}/api/info/ram")).send();
        let disk_fut = self.http.get(format!("{base}/api/zfs/pools/disks-usage")).send();
        let jail_fut = self.http.get(format!("{base}/api/jail/simple")).send();
        let vm_fut = self.http.get(format!("{base}/api/vm/simple")).send();
        let health_fut = async {
            if is_local {
                return None;
            }
            Some(
                self.http
                    .post(format!("{base}/api/health/basic"))
                    .json(&HealthBasicRequest {
                        cluster_key: &self.cluster_key,
                    })
                    .send()
                    .await,
            )
        };

        let (cpu_resp, ram_resp, disk_resp, jail_resp, vm_resp, health_resp) =
            tokio::join!(cpu_fut, ram_fut, disk_fut, jail_fut, vm_fut, health_fut);

        if let Some(Err(e)) = health_resp {
            tracing::debug!(peer = %base, error = %e, "health/basic liveness probe failed");
        }

        let cpu: CpuInfo = cpu_resp?.json().await?;
        let ram: RamInfo = ram_resp?.json().await?;
        let disk: DiskUsage = disk_resp?.json().await?;

        let mut guest_ids = BTreeSet::new();
        if let Ok(resp) = jail_resp {
            if let Ok(envelope) = resp.json::<SimpleListResponse<JailSummary>>().await {
                guest_ids.extend(envelope.data.into_iter().map(|g| g.ct_id));
            }
        }
        if let Ok(resp) = vm_resp {
            if let Ok(envelope) = resp.json::<SimpleListResponse<VmSummary>>().await {
                guest_ids.extend(envelope.data.into_iter().map(|g| g.rid));
            }
        }

        Ok(PeerSnapshot {
            hostname: cpu.hostname,
            cpu_count: cpu.count,
            cpu_pct: cpu.usage_pct,
            mem_bytes: ram.used_bytes,
            mem_pct: ram.used_pct,
            disk_bytes: disk.used_bytes,
            disk_pct: disk.used_pct,
            guest_ids,
        })
    }
}

pub struct HealthReconciler<P: PeerInfoSource> {
    /// Business-identity lookup for every `NodeId` this node's config file
    /// knows about. Raft membership is the source of truth for *which*
    /// nodes are current; this directory only supplies the `uuid`/endpoint
    /// a `NodeId` maps to, since that's not carried in the Raft log.
    directory: HashMap<NodeId, ClusterMember>,
    raft: Arc<FleetRaft>,
    source: Arc<P>,
    storage: Arc<SqliteRaftStorage>,
    router: Arc<CommandRouter>,
}

impl<P: PeerInfoSource> HealthReconciler<P> {
    pub fn new(
        directory: HashMap<NodeId, ClusterMember>,
        raft: Arc<FleetRaft>,
        source: Arc<P>,
        storage: Arc<SqliteRaftStorage>,
        router: Arc<CommandRouter>,
    ) -> Self {
        Self {
            directory,
            raft,
            source,
            storage,
            router,
        }
    }

    /// The live membership, resolved against `directory`. A `NodeId` Raft
    /// reports that isn't in `directory` is skipped; it can't be polled
    /// without an endpoint to poll.
    fn current_members(&self) -> Vec<ClusterMember> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .members
            .iter()
            .filter_map(|id| self.directory.get(id).cloned())
            .collect()
    }

    pub async fn tick(&self) -> FleetResult<()> {
        let sm = self.storage.state_machine_snapshot().await;
        let members = self.current_members();

        let polled = futures::future::join_all(members.iter().map(|member| async move {
            let result = self.source.poll(member).await;
            (member.clone(), result)
        }))
        .await;

        for (member, result) in polled {
            let existing = sm.nodes.get(&member.uuid).cloned();
            let cur = match result {
                Ok(snap) => Node {
                    uuid: member.uuid,
                    api_endpoint: member.api_endpoint.clone(),
                    hostname: snap.hostname,
                    status: NodeStatus::Online,
                    cpu_count: snap.cpu_count,
                    cpu_pct: snap.cpu_pct,
                    mem_bytes: snap.mem_bytes,
                    mem_pct: snap.mem_pct,
                    disk_bytes: snap.disk_bytes,
                    disk_pct: snap.disk_pct,
                    guest_ids: snap.guest_ids,
                },
                Err(_) => {
                    let Some(prev) = existing.clone() else {
                        continue;
                    };
                    if prev.status == NodeStatus::Offline {
                        continue;
                    }
                    Node {
                        status: NodeStatus::Offline,
                        ..prev
                    }
                }
            };

            let changed = match &existing {
                Some(prev) => prev.has_significant_change(&cur),
                None => true,
            };
            if !changed {
                continue;
            }

            self.apply_with_retry(Command::Node(NodeAction::Upsert(cur))).await?;
        }

        let configured: BTreeSet<Uuid> = members.iter().map(|m| m.uuid).collect();
        for uuid in sm.nodes.keys() {
            if !configured.contains(uuid) {
                self.apply_with_retry(Command::Node(NodeAction::Delete { uuid: *uuid })).await?;
            }
        }
        Ok(())
    }

    async fn apply_with_retry(&self, cmd: Command) -> FleetResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.router.apply(cmd.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt + 1 >= WRITE_RETRIES => return Err(e),
                Err(_) => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(WRITE_RETRY_BASE_MS * attempt as u64)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_membership_drives_deletion_set() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let members = vec![ClusterMember {
            uuid: a,
            api_endpoint: "https://10.0.0.1:8123".into(),
        }];
        let configured: BTreeSet<Uuid> = members.iter().map(|m| m.uuid).collect();
        assert!(configured.contains(&a));
        assert!(!configured.contains(&b));
    }
}
