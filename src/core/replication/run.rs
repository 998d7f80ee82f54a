// src/core/replication/run.rs

//! One replication run: pushes `source_dataset` to a single policy target,
//! reusing the backup pipeline's send/rotate/classify primitives but
//! writing a (Raft-replicated) `ReplicationEvent` instead of a node-local
//! `BackupEvent`, and namespacing snapshots `ha_<timestamp>` so they never
//! collide with user-driven backups.

use crate::core::backup::{classify_backup_output, classify_lineage, is_snapshot_name, LineageKind};
use crate::core::dataset::{Dataset, PruneOptions, SendOptions, SshEndpoint};
use crate::core::errors::FleetResult;
use crate::core::model::{
    ClusterSshIdentity, ReplicationEvent, ReplicationEventStatus, ReplicationEventType,
    ReplicationPolicy, ReplicationPolicyTarget,
};
use crate::core::raft::command::{Command, ReplicationEventAction};
use crate::core::raft::router::CommandRouter;
use crate::core::raft::storage::SqliteRaftStorage;
use std::sync::Arc;
use uuid::Uuid;

const RETENTION_KEEP_LAST: u32 = 64;
const LINEAGE_KEEP: usize = 2;

pub struct ReplicationRunner<D: Dataset> {
    dataset: Arc<D>,
    router: Arc<CommandRouter>,
    storage: Arc<SqliteRaftStorage>,
    local_node_id: Uuid,
}

impl<D: Dataset> ReplicationRunner<D> {
    pub fn new(dataset: Arc<D>, router: Arc<CommandRouter>, storage: Arc<SqliteRaftStorage>, local_node_id: Uuid) -> Self {
        Self {
            dataset,
            router,
            storage,
            local_node_id,
        }
    }

    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }

    pub async fn run_target(
        &self,
        policy: &ReplicationPolicy,
        source_dataset: &str,
        target: &ReplicationPolicyTarget,
        identity: &ClusterSshIdentity,
        cluster_key_path: &str,
    ) -> FleetResult<()> {
        let endpoint = SshEndpoint {
            user: identity.ssh_user.clone(),
            host: identity.ssh_host.clone(),
            port: identity.ssh_port,
            key_path: Some(cluster_key_path.to_string()),
        };

        let Some((root, suffix)) = source_dataset.split_once('/') else {
            return Err(crate::core::errors::FleetError::DestinationDatasetInvalid);
        };
        let dest_path = suffix.to_string();
        let _ = root;

        let event_id = crate::core::raft::allocate_id(&self.storage, crate::core::raft::IdKind::ReplicationEvent).await?;
        let mut event = ReplicationEvent {
            id: event_id,
            policy_id: Some(policy.id),
            event_type: ReplicationEventType::Replication,
            status: ReplicationEventStatus::Running,
            source_node_id: self.local_node_id,
            target_node_id: target.node_id,
            guest_type: policy.guest_type,
            guest_id: policy.guest_id,
            started_at: chrono::Utc::now(),
            completed_at: None,
            output: String::new(),
            error: None,
            message: None,
        };
        self.router
            .apply(Command::ReplicationEvent(ReplicationEventAction::Create(event.clone())))
            .await?;

        let snap_prefix = format!("ha_{}", chrono::Utc::now().timestamp());
        let opts = SendOptions {
            snapshot_name_prefix: Some(snap_prefix),
            recv_top_override: false,
        };

        let result = self.send_with_one_rotate_retry(source_dataset, &endpoint, &dest_path, &mut event, &opts).await;

        if result.is_ok() {
            if let Err(e) = self.apply_retention(source_dataset, &endpoint, &dest_path).await {
                event.append_output(&format!("retention pass failed (non-fatal): {e}"));
            }
        }

        event.status = if result.is_ok() {
            ReplicationEventStatus::Success
        } else {
            ReplicationEventStatus::Failed
        };
        event.error = result.as_ref().err().map(|e| e.to_string());
        event.completed_at = Some(chrono::Utc::now());
        self.router
            .apply(Command::ReplicationEvent(ReplicationEventAction::Update(event)))
            .await?;

        result
    }

    async fn send_with_one_rotate_retry(
        &self,
        source: &str,
        endpoint: &SshEndpoint,
        dest_path: &str,
        event: &mut ReplicationEvent,
        opts: &SendOptions,
    ) -> FleetResult<()> {
        let outcome = self.dataset.send(source, endpoint, dest_path, opts).await?;
        event.append_output(&outcome.combined());
        let classified = classify_backup_output(&outcome.combined());
        if classified.is_success() {
            return Ok(());
        }
        if !outcome.lowercased().contains("has been modified") {
            if let Some(err) = classified.error_code() {
                return Err(err);
            }
            return Ok(());
        }

        let rotate_outcome = self.dataset.rotate(source, endpoint, dest_path, Some("ha")).await?;
        event.append_output(&rotate_outcome.combined());

        let retry = self.dataset.send(source, endpoint, dest_path, opts).await?;
        event.append_output(&retry.combined());
        let retry_classified = classify_backup_output(&retry.combined());
        match retry_classified.error_code() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn apply_retention(&self, source: &str, endpoint: &SshEndpoint, dest_path: &str) -> FleetResult<()> {
        let opts = PruneOptions {
            keep_snap_num: RETENTION_KEEP_LAST,
            keep_snap_days: 0,
            swap_args: false,
        };
        let outcome = self.dataset.prune(source, endpoint, dest_path, &opts).await?;
        for line in &outcome.lines {
            if is_snapshot_name(line.trim()) {
                self.dataset.destroy(line.trim(), None).await?;
            }
        }

        let swapped = PruneOptions { swap_args: true, ..opts };
        let target_outcome = self.dataset.prune(source, endpoint, dest_path, &swapped).await?;
        for line in &target_outcome.lines {
            if is_snapshot_name(line.trim()) {
                self.dataset.destroy(line.trim(), Some(endpoint)).await?;
            }
        }

        self.trim_lineage_siblings(source, None).await?;
        self.trim_lineage_siblings(dest_path, Some(endpoint)).await?;
        Ok(())
    }

    /// Keeps only the two lexically-latest `*_zelta_*`/`*.pre_sylve_*`
    /// sibling datasets at the same depth as `base`, destroying the rest.
    async fn trim_lineage_siblings(&self, base: &str, remote: Option<&SshEndpoint>) -> FleetResult<()> {
        let Some((parent, _)) = base.rsplit_once('/') else {
            return Ok(());
        };
        let listing = self.dataset.list_snapshots(parent, remote).await?;
        let mut siblings: Vec<String> = listing
            .into_iter()
            .map(|s| s.dataset)
            .filter(|d| matches!(classify_lineage(base, d), LineageKind::Rotated | LineageKind::Preserved))
            .collect();
        siblings.sort();
        siblings.dedup();
        siblings.reverse();
        for stale in siblings.into_iter().skip(LINEAGE_KEEP) {
            self.dataset.destroy(&stale, remote).await?;
        }
        Ok(())
    }
}
