// src/core/model/backup.rs

//! Cluster-replicated backup objects (`BackupTarget`, `BackupJob`) plus the
//! node-local `BackupEvent` log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A remote host that receives ZFS sends. Owned by the Raft FSM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupTarget {
    pub id: i64,
    pub name: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    /// Exactly one of `ssh_key`/`ssh_key_path` is meaningful at a time; the
    /// executor materialises `ssh_key` to `ssh_key_path` when only the
    /// former is set (see `core::backup::executor::materialise_key`).
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    pub backup_root: String,
    pub enabled: bool,
    #[serde(default)]
    pub create_backup_root: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Dataset,
    Jail,
    Vm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupJobStatus {
    Success,
    Failed,
}

/// A scheduled backup job. Owned by the Raft FSM.
///
/// Invariant: exactly one of `source_dataset` / `jail_root_dataset` is set,
/// selected by `mode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: i64,
    pub name: String,
    pub target_id: i64,
    #[serde(default)]
    pub runner_node_id: Option<uuid::Uuid>,
    pub mode: BackupMode,
    #[serde(default)]
    pub source_dataset: Option<String>,
    #[serde(default)]
    pub jail_root_dataset: Option<String>,
    #[serde(default)]
    pub dest_suffix: Option<String>,
    pub cron_expr: String,
    pub enabled: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub with_intermediates: bool,
    #[serde(default)]
    pub prune_keep_last: u32,
    #[serde(default)]
    pub prune_target: bool,
    #[serde(default)]
    pub stop_before_backup: bool,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<BackupJobStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl BackupJob {
    /// Selects the job's source dataset by mode.
    pub fn resolved_source(&self) -> Option<&str> {
        match self.mode {
            BackupMode::Vm | BackupMode::Dataset => self
                .source_dataset
                .as_deref()
                .or(self.jail_root_dataset.as_deref()),
            BackupMode::Jail => self
                .jail_root_dataset
                .as_deref()
                .or(self.source_dataset.as_deref()),
        }
    }

    pub fn validate(&self) -> Result<(), crate::core::errors::FleetError> {
        use crate::core::errors::FleetError;
        if self.name.trim().is_empty() {
            return Err(FleetError::NameRequired);
        }
        if self.cron_expr.trim().is_empty() {
            return Err(FleetError::CronExprRequired);
        }
        let has_source = self.source_dataset.is_some();
        let has_jail_root = self.jail_root_dataset.is_some();
        if has_source == has_jail_root {
            // exactly one must be set
            return Err(FleetError::InvalidMode);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupEventStatus {
    Running,
    Success,
    Failed,
    Interrupted,
}

/// Node-local execution record of a backup run. Not replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEvent {
    pub id: i64,
    pub job_id: Option<i64>,
    pub mode: BackupMode,
    pub status: BackupEventStatus,
    pub source_dataset: String,
    pub target_endpoint: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub error: Option<String>,
}

impl BackupEvent {
    /// Append-only log semantics: the only mutation `output` ever undergoes
    /// is concatenation.
    pub fn append_output(&mut self, chunk: &str) {
        self.output.push_str(chunk);
        self.output.push('\n');
    }

    /// `running` events older than this are swept to `interrupted` by the
    /// 5-minute SSH-key/event-sweep ticker.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == BackupEventStatus::Running
            && now.signed_duration_since(self.started_at) > chrono::Duration::minutes(15)
    }
}
