// src/core/raft/fsm.rs

//! The deterministic, in-memory projection of every committed log entry.
//! `apply` is the only mutation path; everything else is a read.

use super::command::{
    BackupJobAction, BackupTargetAction, ClusterSshIdentityAction, Command, CommandResponse,
    DirectoryConfigAction, NodeAction, NoteAction, ReplicationEventAction, ReplicationLeaseAction,
    ReplicationPolicyAction, S3ConfigAction,
};
use crate::core::model::{
    BackupJob, BackupTarget, ClusterSshIdentity, DirectoryConfig, Node, Note, ReplicationEvent,
    ReplicationLease, ReplicationPolicy, S3Config, REPLICATION_EVENT_RETENTION,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// A full, serializable snapshot of replicated state. Cheap to clone-compare
/// in tests; written out verbatim by `async_raft`'s log-compaction path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetStateMachine {
    pub nodes: BTreeMap<uuid::Uuid, Node>,
    pub backup_targets: BTreeMap<i64, BackupTarget>,
    pub backup_jobs: BTreeMap<i64, BackupJob>,
    pub replication_policies: BTreeMap<i64, ReplicationPolicy>,
    pub replication_leases: BTreeMap<i64, ReplicationLease>,
    pub replication_events: VecDeque<ReplicationEvent>,
    pub cluster_ssh_identities: BTreeMap<uuid::Uuid, ClusterSshIdentity>,
    pub notes: BTreeMap<i64, Note>,
    pub s3_configs: BTreeMap<i64, S3Config>,
    pub directory_configs: BTreeMap<i64, DirectoryConfig>,

    /// Idempotency keys of the last few thousand applied commands, so a
    /// client retry after a timed-out `Apply` never double-applies.
    #[serde(default)]
    applied_keys: VecDeque<String>,
}

const APPLIED_KEY_RETENTION: usize = 4096;

impl FleetStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed command. Idempotent: a repeated idempotency
    /// key is a no-op that still returns success, so a client that retried
    /// after a timeout sees the original outcome.
    pub fn apply(&mut self, cmd: &Command) -> CommandResponse {
        let key = cmd.idempotency_key();
        if self.applied_keys.contains(&key) {
            return CommandResponse::ok();
        }

        let result = self.apply_uncached(cmd);

        self.applied_keys.push_back(key);
        if self.applied_keys.len() > APPLIED_KEY_RETENTION {
            self.applied_keys.pop_front();
        }

        result
    }

    fn apply_uncached(&mut self, cmd: &Command) -> CommandResponse {
        match cmd {
            Command::Node(a) => self.apply_node(a),
            Command::BackupTarget(a) => self.apply_backup_target(a),
            Command::BackupJob(a) => self.apply_backup_job(a),
            Command::ReplicationPolicy(a) => self.apply_replication_policy(a),
            Command::ReplicationLease(a) => self.apply_replication_lease(a),
            Command::ReplicationEvent(a) => self.apply_replication_event(a),
            Command::ClusterSshIdentity(a) => self.apply_cluster_ssh_identity(a),
            Command::Note(a) => self.apply_note(a),
            Command::S3Config(a) => self.apply_s3_config(a),
            Command::DirectoryConfig(a) => self.apply_directory_config(a),
        }
    }

    fn apply_node(&mut self, a: &NodeAction) -> CommandResponse {
        match a {
            NodeAction::Upsert(n) => {
                self.nodes.insert(n.uuid, n.clone());
            }
            NodeAction::Delete { uuid } => {
                self.nodes.remove(uuid);
            }
        }
        CommandResponse::ok()
    }

    fn apply_backup_target(&mut self, a: &BackupTargetAction) -> CommandResponse {
        match a {
            BackupTargetAction::Create(t) | BackupTargetAction::Update(t) => {
                self.backup_targets.insert(t.id, t.clone());
            }
            BackupTargetAction::Delete { id } => {
                self.backup_targets.remove(id);
            }
        }
        CommandResponse::ok()
    }

    fn apply_backup_job(&mut self, a: &BackupJobAction) -> CommandResponse {
        match a {
            BackupJobAction::Create(j) | BackupJobAction::Update(j) => {
                self.backup_jobs.insert(j.id, j.clone());
            }
            BackupJobAction::Delete { id } => {
                self.backup_jobs.remove(id);
            }
        }
        CommandResponse::ok()
    }

    fn apply_replication_policy(&mut self, a: &ReplicationPolicyAction) -> CommandResponse {
        match a {
            ReplicationPolicyAction::Create(p) => {
                let clash = self.replication_policies.values().any(|existing| {
                    existing.id != p.id
                        && existing.enabled
                        && p.enabled
                        && existing.guest_type == p.guest_type
                        && existing.guest_id == p.guest_id
                });
                if clash {
                    return CommandResponse::err("guest_already_protected_by_policy");
                }
                self.replication_policies.insert(p.id, p.clone());
            }
            ReplicationPolicyAction::Update(p) => {
                self.replication_policies.insert(p.id, p.clone());
            }
            ReplicationPolicyAction::Delete { id } => {
                self.replication_policies.remove(id);
                self.replication_leases.remove(id);
            }
        }
        CommandResponse::ok()
    }

    fn apply_replication_lease(&mut self, a: &ReplicationLeaseAction) -> CommandResponse {
        match a {
            ReplicationLeaseAction::Upsert(l) => {
                if let Some(existing) = self.replication_leases.get(&l.policy_id) {
                    if l.version <= existing.version {
                        return CommandResponse::ok();
                    }
                }
                self.replication_leases.insert(l.policy_id, l.clone());
            }
            ReplicationLeaseAction::Delete { policy_id } => {
                self.replication_leases.remove(policy_id);
            }
        }
        CommandResponse::ok()
    }

    fn apply_replication_event(&mut self, a: &ReplicationEventAction) -> CommandResponse {
        match a {
            ReplicationEventAction::Create(e) => {
                self.replication_events.push_front(e.clone());
                while self.replication_events.len() > REPLICATION_EVENT_RETENTION {
                    self.replication_events.pop_back();
                }
            }
            ReplicationEventAction::Update(e) => {
                if let Some(slot) = self.replication_events.iter_mut().find(|x| x.id == e.id) {
                    *slot = e.clone();
                }
            }
        }
        CommandResponse::ok()
    }

    fn apply_cluster_ssh_identity(&mut self, a: &ClusterSshIdentityAction) -> CommandResponse {
        match a {
            ClusterSshIdentityAction::Upsert(i) => {
                self.cluster_ssh_identities.insert(i.node_uuid, i.clone());
            }
            ClusterSshIdentityAction::Delete { node_uuid } => {
                self.cluster_ssh_identities.remove(node_uuid);
            }
        }
        CommandResponse::ok()
    }

    fn apply_note(&mut self, a: &NoteAction) -> CommandResponse {
        match a {
            NoteAction::Create(n) | NoteAction::Update(n) => {
                self.notes.insert(n.id, n.clone());
            }
            NoteAction::Delete { id } => {
                self.notes.remove(id);
            }
            NoteAction::BulkDelete { ids } => {
                for id in ids {
                    self.notes.remove(id);
                }
            }
        }
        CommandResponse::ok()
    }

    fn apply_s3_config(&mut self, a: &S3ConfigAction) -> CommandResponse {
        match a {
            S3ConfigAction::Create(c) => {
                self.s3_configs.insert(c.id, c.clone());
            }
            S3ConfigAction::Delete { id } => {
                self.s3_configs.remove(id);
            }
        }
        CommandResponse::ok()
    }

    fn apply_directory_config(&mut self, a: &DirectoryConfigAction) -> CommandResponse {
        match a {
            DirectoryConfigAction::Create(c) => {
                self.directory_configs.insert(c.id, c.clone());
            }
            DirectoryConfigAction::Delete { id } => {
                self.directory_configs.remove(id);
            }
        }
        CommandResponse::ok()
    }

    pub fn next_id(&self, kind: IdKind) -> impl Fn(i64) -> bool + '_ {
        move |candidate| match kind {
            IdKind::BackupTarget => self.backup_targets.contains_key(&candidate),
            IdKind::BackupJob => self.backup_jobs.contains_key(&candidate),
            IdKind::ReplicationPolicy => self.replication_policies.contains_key(&candidate),
            IdKind::ReplicationEvent => self.replication_events.iter().any(|e| e.id == candidate),
            IdKind::Note => self.notes.contains_key(&candidate),
            IdKind::S3Config => self.s3_configs.contains_key(&candidate),
            IdKind::DirectoryConfig => self.directory_configs.contains_key(&candidate),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum IdKind {
    BackupTarget,
    BackupJob,
    ReplicationPolicy,
    ReplicationEvent,
    Note,
    S3Config,
    DirectoryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{BackupMode, GuestType, SourceMode};

    fn policy(id: i64, guest_id: u64, enabled: bool) -> ReplicationPolicy {
        ReplicationPolicy {
            id,
            name: format!("policy-{id}"),
            guest_type: GuestType::Jail,
            guest_id,
            source_mode: SourceMode::FollowActive,
            source_node_id: None,
            active_node_id: None,
            failback_mode: crate::core::model::FailbackMode::Manual,
            cron_expr: None,
            enabled,
            next_run_at: None,
            last_status: None,
            last_error: None,
            targets: vec![],
        }
    }

    #[test]
    fn duplicate_apply_is_idempotent() {
        let mut fsm = FleetStateMachine::new();
        let target = BackupTarget {
            id: 1,
            name: "nas".into(),
            ssh_host: "10.0.0.2".into(),
            ssh_port: 22,
            ssh_key: None,
            ssh_key_path: Some("/root/.ssh/id_ed25519".into()),
            backup_root: "tank/backups".into(),
            enabled: true,
            create_backup_root: false,
            description: String::new(),
        };
        let cmd = Command::BackupTarget(BackupTargetAction::Create(target.clone()));
        assert!(fsm.apply(&cmd).ok);
        assert!(fsm.apply(&cmd).ok);
        assert_eq!(fsm.backup_targets.len(), 1);
    }

    #[test]
    fn rejects_second_enabled_policy_for_same_guest() {
        let mut fsm = FleetStateMachine::new();
        let r1 = fsm.apply(&Command::ReplicationPolicy(ReplicationPolicyAction::Create(
            policy(1, 500, true),
        )));
        assert!(r1.ok);
        let r2 = fsm.apply(&Command::ReplicationPolicy(ReplicationPolicyAction::Create(
            policy(2, 500, true),
        )));
        assert!(!r2.ok);
        assert_eq!(fsm.replication_policies.len(), 1);
    }

    #[test]
    fn lease_upsert_rejects_stale_version() {
        let mut fsm = FleetStateMachine::new();
        let node = uuid::Uuid::new_v4();
        let now = chrono::Utc::now();
        let lease_v2 = ReplicationLease {
            policy_id: 1,
            guest_type: GuestType::Jail,
            guest_id: 7,
            owner_node_id: node,
            expires_at: now + chrono::Duration::seconds(10),
            version: 2,
            last_reason: "initial".into(),
            last_actor: "controller".into(),
        };
        let mut lease_v1 = lease_v2.clone();
        lease_v1.version = 1;

        fsm.apply(&Command::ReplicationLease(ReplicationLeaseAction::Upsert(
            lease_v2.clone(),
        )));
        fsm.apply(&Command::ReplicationLease(ReplicationLeaseAction::Upsert(
            lease_v1,
        )));
        assert_eq!(fsm.replication_leases[&1].version, 2);
    }

    #[test]
    fn replication_event_ring_retention() {
        let mut fsm = FleetStateMachine::new();
        for i in 0..(REPLICATION_EVENT_RETENTION as i64 + 10) {
            fsm.apply(&Command::ReplicationEvent(ReplicationEventAction::Create(
                ReplicationEvent {
                    id: i,
                    policy_id: Some(1),
                    event_type: crate::core::model::ReplicationEventType::Replication,
                    status: crate::core::model::ReplicationEventStatus::Success,
                    source_node_id: uuid::Uuid::nil(),
                    target_node_id: uuid::Uuid::nil(),
                    guest_type: GuestType::Jail,
                    guest_id: 1,
                    started_at: chrono::Utc::now(),
                    completed_at: None,
                    output: String::new(),
                    error: None,
                    message: None,
                },
            )));
        }
        assert_eq!(fsm.replication_events.len(), REPLICATION_EVENT_RETENTION);
    }

    #[test]
    fn backup_job_delete_removes_entry() {
        let mut fsm = FleetStateMachine::new();
        let job = BackupJob {
            id: 1,
            name: "nightly".into(),
            target_id: 1,
            runner_node_id: None,
            mode: BackupMode::Dataset,
            source_dataset: Some("tank/data".into()),
            jail_root_dataset: None,
            dest_suffix: None,
            cron_expr: "0 0 * * *".into(),
            enabled: true,
            force: false,
            with_intermediates: false,
            prune_keep_last: 7,
            prune_target: false,
            stop_before_backup: false,
            next_run_at: None,
            last_run_at: None,
            last_status: None,
            last_error: None,
        };
        fsm.apply(&Command::BackupJob(BackupJobAction::Create(job)));
        fsm.apply(&Command::BackupJob(BackupJobAction::Delete { id: 1 }));
        assert!(fsm.backup_jobs.is_empty());
    }
}
