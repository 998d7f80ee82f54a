// src/core/raft/command.rs

//! The typed command envelope that is the sole write path into the FSM.
//! Every mutation to Raft-owned state is one of these, serialized into an
//! `async_raft::raft::Entry<Command>` and applied deterministically by
//! [`super::fsm::FleetStateMachine`].

use crate::core::model::{
    BackupJob, BackupTarget, ClusterSshIdentity, DirectoryConfig, Node, Note, ReplicationLease,
    ReplicationPolicy, S3Config,
};
use serde::{Deserialize, Serialize};

/// One write to replicated state. `async_raft::AppData` requires
/// `Serialize + Deserialize + Send + Sync + 'static`, which this satisfies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Node(NodeAction),
    BackupTarget(BackupTargetAction),
    BackupJob(BackupJobAction),
    ReplicationPolicy(ReplicationPolicyAction),
    ReplicationLease(ReplicationLeaseAction),
    ReplicationEvent(ReplicationEventAction),
    ClusterSshIdentity(ClusterSshIdentityAction),
    Note(NoteAction),
    S3Config(S3ConfigAction),
    DirectoryConfig(DirectoryConfigAction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeAction {
    Upsert(Node),
    Delete { uuid: uuid::Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackupTargetAction {
    Create(BackupTarget),
    Update(BackupTarget),
    Delete { id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackupJobAction {
    Create(BackupJob),
    Update(BackupJob),
    Delete { id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationPolicyAction {
    Create(ReplicationPolicy),
    Update(ReplicationPolicy),
    Delete { id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationLeaseAction {
    Upsert(ReplicationLease),
    Delete { policy_id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationEventAction {
    Create(crate::core::model::ReplicationEvent),
    Update(crate::core::model::ReplicationEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterSshIdentityAction {
    Upsert(ClusterSshIdentity),
    Delete { node_uuid: uuid::Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NoteAction {
    Create(Note),
    Update(Note),
    Delete { id: i64 },
    BulkDelete { ids: Vec<i64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum S3ConfigAction {
    Create(S3Config),
    Delete { id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirectoryConfigAction {
    Create(DirectoryConfig),
    Delete { id: i64 },
}

impl Command {
    /// The idempotency key guarding against a double-apply when a client
    /// retries an `Apply` that actually committed but timed out before the
    /// caller saw the response. Keyed on the full serialized content (not
    /// just a type+primary-key tuple): a genuine retry resubmits identical
    /// bytes, while a later legitimate update to the same object (new
    /// health poll, lease renewal, event status transition) always differs
    /// in content and so must not collide with it.
    pub fn idempotency_key(&self) -> String {
        use std::hash::{Hash, Hasher};
        let payload = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        payload.hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }
}

/// The response returned from `Apply`, satisfying `async_raft::AppDataResponse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ok: bool,
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(msg.into()),
        }
    }
}
