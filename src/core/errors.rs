// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every stable error code surfaced in
/// event records and API responses. Using `thiserror` allows for clean
/// error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum FleetError {
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("http client error: {0}")]
    HttpClientError(String),

    // --- Raft / transport ---
    #[error("raft_apply_failed")]
    RaftApplyFailed,
    #[error("fsm_apply_failed: {0}")]
    FsmApplyFailed(String),
    #[error("raft_not_initialized")]
    RaftNotInitialized,
    #[error("leader_unknown")]
    LeaderUnknown,
    #[error("cluster_ssh_identity_invalid: {0}")]
    ClusterSshInvalid(String),
    #[error("ssh_connection_failed: {0}")]
    SshConnectionFailed(String),
    #[error("unable_to_allocate_unique_id")]
    UnableToAllocateUniqueId,

    // --- Input validation ---
    #[error("invalid_target_id")]
    InvalidTargetId,
    #[error("invalid_job_id")]
    InvalidJobId,
    #[error("invalid_policy_id")]
    InvalidPolicyId,
    #[error("name_required")]
    NameRequired,
    #[error("cron_expr_required")]
    CronExprRequired,
    #[error("invalid_cron_expr: {0}")]
    InvalidCronExpr(String),
    #[error("invalid_mode")]
    InvalidMode,
    #[error("invalid_guest_type")]
    InvalidGuestType,
    #[error("target_id_required")]
    TargetIdRequired,
    #[error("destination_dataset_invalid")]
    DestinationDatasetInvalid,
    #[error("remote_dataset_outside_backup_root")]
    RemoteDatasetOutsideBackupRoot,

    // --- Backup semantics ---
    #[error("backup_source_missing")]
    BackupSourceMissing,
    #[error("backup_source_snapshot_missing")]
    BackupSourceSnapshotMissing,
    #[error("backup_target_has_local_writes")]
    BackupTargetHasLocalWrites,
    #[error("backup_target_diverged")]
    BackupTargetDiverged,
    #[error("backup_auto_rotate_failed")]
    BackupAutoRotateFailed,
    #[error("backup_target_disabled")]
    BackupTargetDisabled,
    #[error("backup_job_already_running")]
    BackupJobAlreadyRunning,
    #[error("backup_pool_not_found")]
    BackupPoolNotFound,
    #[error("backup_root_not_found")]
    BackupRootNotFound,
    #[error("backup_root_create_verify_failed")]
    BackupRootCreateVerifyFailed,

    // --- Restore ---
    #[error("snapshot_required")]
    SnapshotRequired,
    #[error("snapshot_not_found_on_target")]
    SnapshotNotFoundOnTarget,
    #[error("zelta_recv_dataset_missing")]
    ZeltaRecvDatasetMissing,
    #[error("rename_restore_failed")]
    RenameRestoreFailed,
    #[error("destroy_original_failed")]
    DestroyOriginalFailed,
    #[error("reconcile_restored_jail_failed: {0}")]
    ReconcileRestoredJailFailed(String),
    #[error("reconcile_restored_vm_failed: {0}")]
    ReconcileRestoredVmFailed(String),
    #[error("restored_jail_metadata_not_found")]
    RestoredJailMetadataNotFound,
    #[error("restored_vm_metadata_not_found")]
    RestoredVmMetadataNotFound,

    // --- Replication ---
    #[error("guest_already_protected_by_policy")]
    GuestAlreadyProtectedByPolicy,
    #[error("source_node_required_for_pinned_mode")]
    SourceNodeRequiredForPinnedMode,
    #[error("source_node_not_found")]
    SourceNodeNotFound,
    #[error("replication_policy_not_found")]
    ReplicationPolicyNotFound,
    #[error("no_eligible_replication_targets")]
    NoEligibleReplicationTargets,
    #[error("no_healthy_target_nodes")]
    NoHealthyTargetNodes,
    #[error("policy_runner_mismatch")]
    PolicyRunnerMismatch,
    #[error("local_node_id_unavailable")]
    LocalNodeIdUnavailable,
    #[error("no_healthy_failover_target")]
    NoHealthyFailoverTarget,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type FleetResult<T> = Result<T, FleetError>;

impl From<std::io::Error> for FleetError {
    fn from(e: std::io::Error) -> Self {
        FleetError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(e: reqwest::Error) -> Self {
        FleetError::HttpClientError(e.to_string())
    }
}

impl From<rusqlite::Error> for FleetError {
    fn from(e: rusqlite::Error) -> Self {
        FleetError::Internal(format!("sqlite error: {e}"))
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Internal(format!("json error: {e}"))
    }
}

impl From<uuid::Error> for FleetError {
    fn from(e: uuid::Error) -> Self {
        FleetError::Internal(format!("uuid error: {e}"))
    }
}

impl From<cron::error::Error> for FleetError {
    fn from(e: cron::error::Error) -> Self {
        FleetError::InvalidCronExpr(e.to_string())
    }
}
