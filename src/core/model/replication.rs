// src/core/model/replication.rs

//! Replication policy, lease, and event objects (component F/G). All owned
//! by the Raft FSM except `ReplicationEvent`, which is replicated (unlike
//! `BackupEvent`) because remote nodes need to observe a failover's
//! progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    Jail,
    Vm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    FollowActive,
    Pinned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailbackMode {
    Manual,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationPolicyTarget {
    pub policy_id: i64,
    pub node_id: uuid::Uuid,
    pub weight: i64,
}

/// A policy covering exactly one `(guest_type, guest_id)` pair while
/// enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    pub id: i64,
    pub name: String,
    pub guest_type: GuestType,
    pub guest_id: u64,
    pub source_mode: SourceMode,
    #[serde(default)]
    pub source_node_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub active_node_id: Option<uuid::Uuid>,
    pub failback_mode: FailbackMode,
    #[serde(default)]
    pub cron_expr: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub targets: Vec<ReplicationPolicyTarget>,
}

impl ReplicationPolicy {
    /// Sorted by descending weight, then ascending node id, deduplicated by
    /// node id.
    pub fn normalised_targets(&self) -> Vec<ReplicationPolicyTarget> {
        let mut seen = std::collections::HashSet::new();
        let mut out: Vec<ReplicationPolicyTarget> = self
            .targets
            .iter()
            .filter(|t| seen.insert(t.node_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.node_id.cmp(&b.node_id)));
        out
    }

    pub fn validate(&self) -> Result<(), crate::core::errors::FleetError> {
        use crate::core::errors::FleetError;
        if self.name.trim().is_empty() {
            return Err(FleetError::NameRequired);
        }
        if self.source_mode == SourceMode::Pinned && self.source_node_id.is_none() {
            return Err(FleetError::SourceNodeRequiredForPinnedMode);
        }
        Ok(())
    }

    /// The runner node: `source_node_id` when pinned, otherwise
    /// `active_node_id`.
    pub fn runner_node_id(&self) -> Option<uuid::Uuid> {
        match self.source_mode {
            SourceMode::Pinned => self.source_node_id,
            SourceMode::FollowActive => self.active_node_id,
        }
    }
}

/// A short-TTL, Raft-replicated ownership lease over a protected guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationLease {
    pub policy_id: i64,
    pub guest_type: GuestType,
    pub guest_id: u64,
    pub owner_node_id: uuid::Uuid,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
    pub last_reason: String,
    pub last_actor: String,
}

impl ReplicationLease {
    pub const TTL_SECS: i64 = 10;

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_owned_by(&self, node_id: uuid::Uuid, now: DateTime<Utc>) -> bool {
        self.owner_node_id == node_id && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationEventType {
    Replication,
    Failover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationEventStatus {
    Running,
    Success,
    Failed,
}

/// Raft-replicated event log for replication runs and failovers. Ring
/// retention by `started_at` desc; entries whose policy no longer exists
/// are swept on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub id: i64,
    pub policy_id: Option<i64>,
    pub event_type: ReplicationEventType,
    pub status: ReplicationEventStatus,
    pub source_node_id: uuid::Uuid,
    pub target_node_id: uuid::Uuid,
    pub guest_type: GuestType,
    pub guest_id: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub error: Option<String>,
    pub message: Option<String>,
}

impl ReplicationEvent {
    pub fn append_output(&mut self, chunk: &str) {
        self.output.push_str(chunk);
        self.output.push('\n');
    }
}

pub const REPLICATION_EVENT_RETENTION: usize = 500;
