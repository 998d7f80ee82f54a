// src/core/replication/scheduler.rs

//! The replication policy engine's ticking loop (component F): a 5 s tick
//! that self-fences, re-publishes this node's cluster SSH identity every
//! 30 s, and advances `next_run_at` for policies this node runs; a worker
//! tick drains the durable queue and pushes every configured target.

use crate::core::capability::GuestLifecycle;
use crate::core::dataset::Dataset;
use crate::core::errors::FleetResult;
use crate::core::failover::run_self_fence_tick;
use crate::core::model::{ClusterSshIdentity, GuestType, NodeStatus, ReplicationPolicy, SourceMode};
use crate::core::queue::DurableQueue;
use crate::core::raft::command::{ClusterSshIdentityAction, Command, ReplicationPolicyAction};
use crate::core::raft::router::CommandRouter;
use crate::core::raft::storage::SqliteRaftStorage;
use crate::core::replication::run::ReplicationRunner;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

pub const REPLICATION_QUEUE_NAME: &str = "zelta-replication-run";
const REPLICATION_LEASE_SECS: i64 = 900;
const IDENTITY_RENEW_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationRunMessage {
    pub policy_id: i64,
}

pub struct ReplicationScheduler<D: Dataset, G: GuestLifecycle> {
    local_node_id: Uuid,
    local_pool: String,
    storage: Arc<SqliteRaftStorage>,
    router: Arc<CommandRouter>,
    queue: Arc<DurableQueue>,
    guests: Arc<G>,
    runner: Arc<ReplicationRunner<D>>,
    local_identity: ClusterSshIdentity,
    cluster_key_path: String,
    last_identity_publish: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl<D: Dataset, G: GuestLifecycle> ReplicationScheduler<D, G> {
    pub fn new(
        local_node_id: Uuid,
        local_pool: impl Into<String>,
        storage: Arc<SqliteRaftStorage>,
        router: Arc<CommandRouter>,
        queue: Arc<DurableQueue>,
        guests: Arc<G>,
        runner: Arc<ReplicationRunner<D>>,
        local_identity: ClusterSshIdentity,
        cluster_key_path: impl Into<String>,
    ) -> Self {
        Self {
            local_node_id,
            local_pool: local_pool.into(),
            storage,
            router,
            queue,
            guests,
            runner,
            local_identity,
            cluster_key_path: cluster_key_path.into(),
            last_identity_publish: Mutex::new(None),
        }
    }

    fn is_local_runner(&self, policy: &ReplicationPolicy, raft_leader_is_local: bool) -> bool {
        let runner = match policy.source_mode {
            SourceMode::Pinned => policy.source_node_id,
            SourceMode::FollowActive => policy.active_node_id.or(policy.source_node_id),
        };
        match runner {
            Some(id) => id == self.local_node_id,
            None => raft_leader_is_local,
        }
    }

    /// The 5 s tick: self-fence, re-publish this node's SSH identity, and
    /// advance/enqueue due policies this node runs.
    pub async fn tick(&self) -> FleetResult<()> {
        let sm = self.storage.state_machine_snapshot().await;
        let now = chrono::Utc::now();

        run_self_fence_tick(&sm, self.local_node_id, self.guests.as_ref(), now).await;

        let due_for_renewal = match *self.last_identity_publish.lock() {
            None => true,
            Some(last) => (now - last).num_seconds() >= IDENTITY_RENEW_SECS,
        };
        if due_for_renewal {
            self.router
                .apply(Command::ClusterSshIdentity(ClusterSshIdentityAction::Upsert(
                    self.local_identity.clone(),
                )))
                .await?;
            *self.last_identity_publish.lock() = Some(now);
        }

        let leader = self.router.current_leader().await;
        let raft_leader_is_local = self.router.is_local_leader(leader);

        for policy in sm.replication_policies.values() {
            if !policy.enabled {
                continue;
            }
            if !self.is_local_runner(policy, raft_leader_is_local) {
                continue;
            }
            let Some(cron_expr) = &policy.cron_expr else {
                continue;
            };
            let schedule = match cron::Schedule::from_str(cron_expr) {
                Ok(s) => s,
                Err(_) => continue,
            };

            match policy.next_run_at {
                None => {
                    if let Some(next) = schedule.upcoming(chrono::Utc).next() {
                        let mut updated = policy.clone();
                        updated.next_run_at = Some(next);
                        self.router
                            .apply(Command::ReplicationPolicy(ReplicationPolicyAction::Update(updated)))
                            .await?;
                    }
                }
                Some(next_run_at) if now >= next_run_at => {
                    let mut updated = policy.clone();
                    updated.next_run_at = schedule.after(&now).next();
                    self.router
                        .apply(Command::ReplicationPolicy(ReplicationPolicyAction::Update(updated)))
                        .await?;
                    self.queue
                        .enqueue(REPLICATION_QUEUE_NAME, &ReplicationRunMessage { policy_id: policy.id })?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Pops one queued policy run and pushes every online, identified
    /// target in descending-weight order. A target with no registered SSH
    /// identity, or whose node is offline, is skipped rather than failed.
    pub async fn drain_one(&self) -> FleetResult<bool> {
        let delivery = self
            .queue
            .dequeue::<ReplicationRunMessage>(REPLICATION_QUEUE_NAME, REPLICATION_LEASE_SECS)?;
        let Some(delivery) = delivery else {
            return Ok(false);
        };

        let sm = self.storage.state_machine_snapshot().await;
        let Some(policy) = sm.replication_policies.get(&delivery.payload.policy_id).cloned() else {
            self.queue.ack(delivery.id)?;
            return Ok(true);
        };

        let source_dataset = self.resolve_source_dataset(&sm, policy.guest_type, policy.guest_id).await?;

        for target in policy.normalised_targets() {
            let node_online = sm
                .nodes
                .get(&target.node_id)
                .map(|n| n.status == NodeStatus::Online)
                .unwrap_or(false);
            if !node_online {
                continue;
            }
            let Some(identity) = sm.cluster_ssh_identities.get(&target.node_id) else {
                continue;
            };
            self.runner
                .run_target(&policy, &source_dataset, &target, identity, &self.cluster_key_path)
                .await?;
        }

        self.queue.ack(delivery.id)?;
        Ok(true)
    }

    /// Jails have exactly one source dataset per the `<pool>/sylve/jails/<ctid>`
    /// convention. VMs have none on record: the real dataset is discovered by
    /// listing `<pool>/sylve/virtual-machines` and picking the child ending in
    /// `/<rid>`, rejecting it if it lies inside an enabled backup root (the
    /// same self-ingest guard the backup executor applies).
    async fn resolve_source_dataset(
        &self,
        sm: &crate::core::raft::fsm::FleetStateMachine,
        guest_type: GuestType,
        guest_id: u64,
    ) -> FleetResult<String> {
        let fallback = guest_dataset_path(&self.local_pool, guest_type, guest_id);
        if guest_type != GuestType::Vm {
            return Ok(fallback);
        }

        let parent = format!("{}/sylve/virtual-machines", self.local_pool);
        let children = self.runner.dataset().list_local_datasets(&parent).await?;
        let enabled_backup_roots: Vec<String> = sm
            .backup_targets
            .values()
            .filter(|t| t.enabled)
            .map(|t| t.backup_root.clone())
            .collect();
        let suffix = format!("/{guest_id}");

        Ok(children
            .into_iter()
            .find(|d| d.ends_with(&suffix) && !enabled_backup_roots.iter().any(|root| is_within_root(d, root)))
            .unwrap_or(fallback))
    }
}

fn is_within_root(dataset: &str, root: &str) -> bool {
    dataset == root || dataset.starts_with(&format!("{root}/"))
}

/// Both guest kinds follow the same `<pool>/sylve/{jails,virtual-machines}/<id>`
/// convention already used by the backup executor's `guest_ref` and the
/// restore engine's `classify_guest_suffix`.
fn guest_dataset_path(pool: &str, guest_type: crate::core::model::GuestType, guest_id: u64) -> String {
    let suffix = match guest_type {
        crate::core::model::GuestType::Jail => "jails",
        crate::core::model::GuestType::Vm => "virtual-machines",
    };
    format!("{pool}/sylve/{suffix}/{guest_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_dataset_path_matches_jail_and_vm_conventions() {
        assert_eq!(
            guest_dataset_path("zroot", crate::core::model::GuestType::Jail, 105),
            "zroot/sylve/jails/105"
        );
        assert_eq!(
            guest_dataset_path("zroot", crate::core::model::GuestType::Vm, 7),
            "zroot/sylve/virtual-machines/7"
        );
    }
}
