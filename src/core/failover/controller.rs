// src/core/failover/controller.rs

//! The failover controller (component G): leader-only. Renews leases for
//! online owners, and after three consecutive misses picks a new owner and
//! activates the guest there (locally, or over HTTP on the remote node).

use crate::core::capability::GuestLifecycle;
use crate::core::dataset::Dataset;
use crate::core::errors::{FleetError, FleetResult};
use crate::core::jwt::ClusterJwt;
use crate::core::model::{
    FailbackMode, NodeStatus, ReplicationEvent, ReplicationEventStatus, ReplicationEventType,
    ReplicationLease, ReplicationPolicy,
};
use crate::core::raft::command::{Command, ReplicationEventAction, ReplicationLeaseAction, ReplicationPolicyAction};
use crate::core::raft::router::CommandRouter;
use crate::core::raft::storage::SqliteRaftStorage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const MISSES_BEFORE_FAILOVER: u32 = 3;

pub struct FailoverController<D: Dataset, G: GuestLifecycle> {
    local_node_id: Uuid,
    dataset: Arc<D>,
    guests: Arc<G>,
    storage: Arc<SqliteRaftStorage>,
    router: Arc<CommandRouter>,
    jwt: Arc<ClusterJwt>,
    http: reqwest::Client,
    down_misses: Mutex<HashMap<i64, u32>>,
}

impl<D: Dataset, G: GuestLifecycle> FailoverController<D, G> {
    pub fn local_node_id(&self) -> Uuid {
        self.local_node_id
    }

    pub fn new(
        local_node_id: Uuid,
        dataset: Arc<D>,
        guests: Arc<G>,
        storage: Arc<SqliteRaftStorage>,
        router: Arc<CommandRouter>,
        jwt: Arc<ClusterJwt>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .danger_accept_invalid_certs(true)
            .build()
            .expect("building failover activation http client");
        Self {
            local_node_id,
            dataset,
            guests,
            storage,
            router,
            jwt,
            http,
            down_misses: Mutex::new(HashMap::new()),
        }
    }

    pub async fn tick(&self) -> FleetResult<()> {
        let sm = self.storage.state_machine_snapshot().await;
        let now = chrono::Utc::now();

        for policy in sm.replication_policies.values() {
            if !policy.enabled {
                continue;
            }

            let Some(owner) = policy.active_node_id.or(policy.source_node_id) else {
                if let Some(node) = sm.nodes.values().find(|n| n.guest_ids.contains(&policy.guest_id)) {
                    let mut updated = policy.clone();
                    updated.active_node_id = Some(node.uuid);
                    self.router
                        .apply(Command::ReplicationPolicy(ReplicationPolicyAction::Update(updated)))
                        .await?;
                }
                continue;
            };

            let owner_online = sm
                .nodes
                .get(&owner)
                .map(|n| n.status == NodeStatus::Online)
                .unwrap_or(false);

            if owner_online {
                self.down_misses.lock().insert(policy.id, 0);
                self.renew_lease(policy, owner, now, "leader_renew").await?;

                if policy.failback_mode == FailbackMode::Auto {
                    if let Some(source) = policy.source_node_id {
                        let source_online = sm
                            .nodes
                            .get(&source)
                            .map(|n| n.status == NodeStatus::Online)
                            .unwrap_or(false);
                        if source != owner && source_online {
                            self.failover_policy_to_node(policy, source, owner, "auto_failback", &sm).await?;
                        }
                    }
                }
                continue;
            }

            let misses = {
                let mut guard = self.down_misses.lock();
                let entry = guard.entry(policy.id).or_insert(0);
                *entry += 1;
                *entry
            };

            if misses < MISSES_BEFORE_FAILOVER {
                continue;
            }

            let candidate = policy
                .normalised_targets()
                .into_iter()
                .filter(|t| t.node_id != owner)
                .filter(|t| {
                    sm.nodes
                        .get(&t.node_id)
                        .map(|n| n.status == NodeStatus::Online)
                        .unwrap_or(false)
                })
                .min_by(|a, b| {
                    let load_a = sm.nodes.get(&a.node_id).map(|n| n.load_score()).unwrap_or(f64::MAX);
                    let load_b = sm.nodes.get(&b.node_id).map(|n| n.load_score()).unwrap_or(f64::MAX);
                    b.weight
                        .cmp(&a.weight)
                        .then(load_a.partial_cmp(&load_b).unwrap_or(std::cmp::Ordering::Equal))
                        .then(a.node_id.cmp(&b.node_id))
                });

            match candidate {
                Some(target) => {
                    self.failover_policy_to_node(policy, target.node_id, owner, "lease_expired_failover", &sm)
                        .await?;
                    self.down_misses.lock().insert(policy.id, 0);
                }
                None => {
                    self.emit_event(
                        policy,
                        owner,
                        owner,
                        ReplicationEventStatus::Failed,
                        Some("no_healthy_failover_target".into()),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn renew_lease(&self, policy: &ReplicationPolicy, owner: Uuid, now: chrono::DateTime<chrono::Utc>, reason: &str) -> FleetResult<()> {
        let lease = ReplicationLease {
            policy_id: policy.id,
            guest_type: policy.guest_type,
            guest_id: policy.guest_id,
            owner_node_id: owner,
            expires_at: now + chrono::Duration::seconds(ReplicationLease::TTL_SECS),
            version: now.timestamp_nanos_opt().unwrap_or_default() as u64,
            last_reason: reason.into(),
            last_actor: "failover_controller".into(),
        };
        self.router
            .apply(Command::ReplicationLease(ReplicationLeaseAction::Upsert(lease)))
            .await?;
        Ok(())
    }

    async fn failover_policy_to_node(
        &self,
        policy: &ReplicationPolicy,
        new_owner: Uuid,
        old_owner: Uuid,
        reason: &str,
        sm: &crate::core::raft::FleetStateMachine,
    ) -> FleetResult<()> {
        let mut updated = policy.clone();
        updated.active_node_id = Some(new_owner);
        if policy.source_mode == crate::core::model::SourceMode::FollowActive {
            updated.source_node_id = Some(new_owner);
        }
        self.router
            .apply(Command::ReplicationPolicy(ReplicationPolicyAction::Update(updated)))
            .await?;

        self.renew_lease(policy, new_owner, chrono::Utc::now(), reason).await?;
        self.emit_event(policy, old_owner, new_owner, ReplicationEventStatus::Running, None)
            .await?;

        if new_owner == self.local_node_id {
            self.activate_locally(policy).await?;
        } else if let Some(node) = sm.nodes.get(&new_owner) {
            self.activate_remote(&node.api_endpoint, policy.id).await?;
        }
        Ok(())
    }

    /// Entry point for the peer HTTP API's activate endpoint: the remote
    /// node that just became `active_node_id` for a policy calls this to
    /// mount and start the guest locally.
    pub async fn activate_by_policy_id(&self, policy_id: i64) -> FleetResult<()> {
        let sm = self.storage.state_machine_snapshot().await;
        let policy = sm
            .replication_policies
            .get(&policy_id)
            .ok_or(FleetError::ReplicationPolicyNotFound)?;
        self.activate_locally(policy).await
    }

    /// Mounts the guest's dataset subtree and starts it via the guest
    /// driver. Metadata reconciliation for a never-seen-here guest goes
    /// through the restore engine's `GuestMetadataBuilder`, not this path.
    async fn activate_locally(&self, policy: &ReplicationPolicy) -> FleetResult<()> {
        let suffix = match policy.guest_type {
            crate::core::model::GuestType::Jail => format!("jails/{}", policy.guest_id),
            crate::core::model::GuestType::Vm => format!("virtual-machines/{}", policy.guest_id),
        };
        self.dataset.mount(&suffix).await?;
        self.guests.start(policy.guest_type, policy.guest_id).await?;
        Ok(())
    }

    async fn activate_remote(&self, api_endpoint: &str, policy_id: i64) -> FleetResult<()> {
        let token = self.jwt.issue(self.local_node_id, chrono::Duration::seconds(30))?;
        let url = format!("{api_endpoint}/api/cluster/replication/internal/activate");
        self.http
            .post(url)
            .header("X-Cluster-Token", format!("Bearer {token}"))
            .json(&serde_json::json!({ "policy_id": policy_id }))
            .send()
            .await?;
        Ok(())
    }

    async fn emit_event(
        &self,
        policy: &ReplicationPolicy,
        source_node_id: Uuid,
        target_node_id: Uuid,
        status: ReplicationEventStatus,
        message: Option<String>,
    ) -> FleetResult<()> {
        let id = crate::core::raft::allocate_id(&self.storage, crate::core::raft::IdKind::ReplicationEvent).await?;
        let event = ReplicationEvent {
            id,
            policy_id: Some(policy.id),
            event_type: ReplicationEventType::Failover,
            status,
            source_node_id,
            target_node_id,
            guest_type: policy.guest_type,
            guest_id: policy.guest_id,
            started_at: chrono::Utc::now(),
            completed_at: (status != ReplicationEventStatus::Running).then(chrono::Utc::now),
            output: String::new(),
            error: message.clone(),
            message,
        };
        self.router
            .apply(Command::ReplicationEvent(ReplicationEventAction::Create(event)))
            .await?;
        Ok(())
    }
}
