// src/core/restore/engine.rs

//! Pulls a remote dataset@snapshot back onto this node and, for jail/VM
//! destinations, reconciles the guest's own metadata through the narrow
//! [`GuestMetadataBuilder`]/[`NetworkSync`] capabilities rather than parsing
//! `jail.json`/`vm.json` here. That keeps this engine free of hypervisor
//! specifics; see [`crate::core::capability`].

use crate::core::capability::{GuestMetadataBuilder, NetworkSync};
use crate::core::dataset::{Dataset, SshEndpoint};
use crate::core::errors::{FleetError, FleetResult};
use crate::core::model::{BackupTarget, GuestType};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

const RESTORING_SUFFIX: &str = ".restoring";
const DESTROY_RETRIES: u32 = 5;
const DESTROY_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub remote_dataset: String,
    pub snapshot: String,
    pub destination_dataset: String,
}

/// FNV-1a, 32-bit: a small, dependency-free hash good enough to turn a
/// dataset path into a lock-table key.
pub fn fnv1a32(input: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;
    input.bytes().fold(OFFSET_BASIS, |hash, byte| (hash ^ byte as u32).wrapping_mul(PRIME))
}

pub struct RestoreEngine<D: Dataset, M: GuestMetadataBuilder, S: NetworkSync> {
    dataset: Arc<D>,
    metadata: Arc<M>,
    network: Arc<S>,
    locks: Mutex<HashSet<u32>>,
}

struct LockGuard<'a> {
    locks: &'a Mutex<HashSet<u32>>,
    key: u32,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.key);
    }
}

impl<D, M, S> RestoreEngine<D, M, S>
where
    D: Dataset + 'static,
    M: GuestMetadataBuilder + 'static,
    S: NetworkSync + 'static,
{
    /// Runs `run` on a spawned task and swallows a panic instead of letting
    /// it unwind into the durable-queue worker loop: a restore is
    /// destructive and must never be retried after a partial, panicked run.
    pub async fn run_guarded(
        self: Arc<Self>,
        req: RestoreRequest,
        target: BackupTarget,
        known_backup_roots: Vec<String>,
    ) -> FleetResult<()> {
        let handle = tokio::spawn(async move { self.run(&req, &target, &known_backup_roots).await });
        match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                tracing::error!(error = %join_err, "restore handler panicked; treating as terminal, not retrying");
                Ok(())
            }
        }
    }
}

impl<D: Dataset, M: GuestMetadataBuilder, S: NetworkSync> RestoreEngine<D, M, S> {
    pub fn new(dataset: Arc<D>, metadata: Arc<M>, network: Arc<S>) -> Self {
        Self {
            dataset,
            metadata,
            network,
            locks: Mutex::new(HashSet::new()),
        }
    }

    fn acquire(&self, destination_dataset: &str) -> FleetResult<LockGuard<'_>> {
        let key = fnv1a32(destination_dataset);
        let mut locks = self.locks.lock();
        if !locks.insert(key) {
            return Err(FleetError::Internal("restore already in progress for this destination".into()));
        }
        drop(locks);
        Ok(LockGuard { locks: &self.locks, key })
    }

    /// Runs `req` against `target`'s SSH identity. `known_backup_roots` is
    /// every enabled target's `backup_root`, used to reject a destination
    /// that would self-ingest from a backup root.
    pub async fn run(
        &self,
        req: &RestoreRequest,
        target: &BackupTarget,
        known_backup_roots: &[String],
    ) -> FleetResult<()> {
        let _guard = self.acquire(&req.destination_dataset)?;
        self.validate_destination(&req.destination_dataset, known_backup_roots)?;

        let endpoint = SshEndpoint {
            user: "root".into(),
            host: target.ssh_host.clone(),
            port: target.ssh_port,
            key_path: target.ssh_key_path.clone(),
        };

        let resolved_source = self.resolve_snapshot_source(req, &endpoint).await?;

        let restoring_path = format!("{}{RESTORING_SUFFIX}", req.destination_dataset);
        self.destroy_with_retries(&restoring_path).await;

        self.dataset
            .pull(&resolved_source, &req.snapshot, &endpoint, &restoring_path)
            .await?;

        let backup_dataset = self.swap_in_restored_dataset(&req.destination_dataset, &restoring_path).await?;

        self.dataset.set_property(&req.destination_dataset, "readonly", "off").await?;
        self.dataset.set_property(&req.destination_dataset, "canmount", "on").await?;
        self.dataset.set_property(&req.destination_dataset, "mountpoint", "inherit").await?;
        self.dataset.mount(&req.destination_dataset).await?;

        let reconcile = self.reconcile_guest(&req.destination_dataset).await;
        match (reconcile, backup_dataset) {
            (Ok(()), Some(backup)) => {
                self.dataset.destroy(&backup, None).await?;
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(e), Some(backup)) => {
                let _ = self.dataset.rename(&req.destination_dataset, &restoring_path, None).await;
                let _ = self.dataset.rename(&backup, &req.destination_dataset, None).await;
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    fn validate_destination(&self, destination_dataset: &str, known_backup_roots: &[String]) -> FleetResult<()> {
        if destination_dataset.contains('@') || !destination_dataset.contains('/') {
            return Err(FleetError::DestinationDatasetInvalid);
        }
        if known_backup_roots.iter().any(|root| destination_dataset.starts_with(root.as_str())) {
            return Err(FleetError::RemoteDatasetOutsideBackupRoot);
        }
        Ok(())
    }

    /// Lists the remote parent (recursively, which also covers lineage
    /// siblings) and resolves which dataset actually carries the requested
    /// snapshot.
    async fn resolve_snapshot_source(&self, req: &RestoreRequest, endpoint: &SshEndpoint) -> FleetResult<String> {
        if req.snapshot.trim().is_empty() {
            return Err(FleetError::SnapshotRequired);
        }
        let Some((parent, _)) = req.remote_dataset.rsplit_once('/') else {
            return Ok(req.remote_dataset.clone());
        };
        let listing = self.dataset.list_snapshots(parent, Some(endpoint)).await?;
        let mut by_dataset: std::collections::BTreeMap<String, Vec<crate::core::dataset::SnapshotInfo>> =
            std::collections::BTreeMap::new();
        for snap in listing {
            by_dataset.entry(snap.dataset.clone()).or_default().push(snap);
        }
        let siblings: Vec<(String, Vec<crate::core::dataset::SnapshotInfo>)> = by_dataset.into_iter().collect();

        crate::core::backup::lineage::resolve_snapshot_owner(&req.remote_dataset, &req.snapshot, &siblings)
            .map(str::to_string)
            .ok_or(FleetError::SnapshotNotFoundOnTarget)
    }

    async fn destroy_with_retries(&self, dataset: &str) {
        for attempt in 0..DESTROY_RETRIES {
            match self.dataset.destroy(dataset, None).await {
                Ok(()) => return,
                Err(_) if attempt + 1 < DESTROY_RETRIES => {
                    tokio::time::sleep(std::time::Duration::from_millis(DESTROY_RETRY_DELAY_MS)).await;
                }
                Err(_) => return,
            }
        }
    }

    /// Renames the live `destination_dataset` out of the way (if present)
    /// and swings `restoring_path` into its place, rolling back on failure.
    /// Returns the backup-dataset name when one was created.
    async fn swap_in_restored_dataset(
        &self,
        destination_dataset: &str,
        restoring_path: &str,
    ) -> FleetResult<Option<String>> {
        let ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let backup_dataset = format!("{destination_dataset}.pre_restore_{ns}");

        let existed = self.dataset.rename(destination_dataset, &backup_dataset, None).await.is_ok();

        match self.dataset.rename(restoring_path, destination_dataset, None).await {
            Ok(()) => Ok(existed.then_some(backup_dataset)),
            Err(_) => {
                if existed {
                    let _ = self.dataset.rename(&backup_dataset, destination_dataset, None).await;
                }
                Err(FleetError::RenameRestoreFailed)
            }
        }
    }

    async fn reconcile_guest(&self, destination_dataset: &str) -> FleetResult<()> {
        let Some((guest_type, guest_id)) = classify_guest_suffix(destination_dataset) else {
            return Ok(());
        };
        let metadata = self.load_guest_metadata(guest_type, destination_dataset).await?;
        self.metadata.create_config(guest_type, &metadata).await?;
        self.network.sync_standard_switches(guest_type, guest_id).await?;
        Ok(())
    }

    /// Reads the restored dataset's own `.sylve/jail.json` (jail) or
    /// `.sylve/vm.json` (VM), the metadata that travelled alongside the
    /// snapshot, rather than fabricating a stand-in. `dataset` is merged in
    /// so a metadata builder can still recover the destination even if the
    /// file predates that field.
    async fn load_guest_metadata(&self, guest_type: GuestType, destination_dataset: &str) -> FleetResult<serde_json::Value> {
        let mountpoint = self.dataset.mountpoint(destination_dataset).await?;
        let file_name = match guest_type {
            GuestType::Jail => "jail.json",
            GuestType::Vm => "vm.json",
        };
        let path = std::path::Path::new(&mountpoint).join(".sylve").join(file_name);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FleetError::Internal(format!("reading {}: {e}", path.display())))?;
        let mut metadata: serde_json::Value = serde_json::from_slice(&bytes)?;
        if let serde_json::Value::Object(ref mut map) = metadata {
            map.entry("dataset").or_insert_with(|| serde_json::Value::String(destination_dataset.to_string()));
        }
        Ok(metadata)
    }
}

fn classify_guest_suffix(destination_dataset: &str) -> Option<(GuestType, u64)> {
    let mut segments = destination_dataset.rsplit('/');
    let id = segments.next()?.parse::<u64>().ok()?;
    match segments.next()? {
        "jails" => Some((GuestType::Jail, id)),
        "virtual-machines" => Some((GuestType::Vm, id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::mock::MockDataset;

    struct MockMetadataBuilder {
        calls: Mutex<Vec<GuestType>>,
    }

    #[async_trait::async_trait]
    impl GuestMetadataBuilder for MockMetadataBuilder {
        async fn create_config(&self, guest_type: GuestType, _metadata: &serde_json::Value) -> FleetResult<()> {
            self.calls.lock().push(guest_type);
            Ok(())
        }
    }

    struct MockNetworkSync;

    #[async_trait::async_trait]
    impl NetworkSync for MockNetworkSync {
        async fn sync_standard_switches(&self, _guest_type: GuestType, _guest_id: u64) -> FleetResult<()> {
            Ok(())
        }
    }

    fn target() -> BackupTarget {
        BackupTarget {
            id: 1,
            name: "nas".into(),
            ssh_host: "10.0.0.9".into(),
            ssh_port: 22,
            ssh_key: None,
            ssh_key_path: Some("/root/.ssh/id_cluster".into()),
            backup_root: "tank/backups".into(),
            enabled: true,
            create_backup_root: false,
            description: String::new(),
        }
    }

    #[test]
    fn fnv1a32_is_deterministic_and_distinguishes_inputs() {
        assert_eq!(fnv1a32("zroot/sylve/jails/105"), fnv1a32("zroot/sylve/jails/105"));
        assert_ne!(fnv1a32("zroot/sylve/jails/105"), fnv1a32("zroot/sylve/jails/106"));
    }

    #[test]
    fn classifies_jail_and_vm_suffixes() {
        assert_eq!(classify_guest_suffix("zroot/bk/jails/105"), Some((GuestType::Jail, 105)));
        assert_eq!(
            classify_guest_suffix("zroot/bk/virtual-machines/7"),
            Some((GuestType::Vm, 7))
        );
        assert_eq!(classify_guest_suffix("zroot/bk/datasets/misc"), None);
    }

    #[tokio::test]
    async fn rejects_destination_overlapping_a_backup_root() {
        let dataset = Arc::new(MockDataset::default());
        let metadata = Arc::new(MockMetadataBuilder { calls: Mutex::new(vec![]) });
        let network = Arc::new(MockNetworkSync);
        let engine = RestoreEngine::new(dataset, metadata, network);
        let req = RestoreRequest {
            remote_dataset: "zroot/bk/jails/105".into(),
            snapshot: "zelta_2026-02-18_12.00.00".into(),
            destination_dataset: "tank/backups/jails/105".into(),
        };
        let err = engine
            .run(&req, &target(), &["tank/backups".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::RemoteDatasetOutsideBackupRoot));
    }

    #[tokio::test]
    async fn restores_into_destination_and_reconciles_jail_guest() {
        let dataset = Arc::new(MockDataset::default());
        dataset.snapshots.lock().insert(
            "zroot/bk/jails".into(),
            vec![crate::core::dataset::SnapshotInfo {
                dataset: "zroot/bk/jails/105".into(),
                short_name: "zelta_2026-02-18_12.00.00".into(),
                created_at: chrono::Utc::now(),
            }],
        );
        let mount_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(mount_dir.path().join(".sylve")).unwrap();
        std::fs::write(
            mount_dir.path().join(".sylve").join("jail.json"),
            serde_json::to_vec(&serde_json::json!({ "ctid": 105, "name": "web" })).unwrap(),
        )
        .unwrap();
        dataset
            .mountpoints
            .lock()
            .insert("zroot/sylve/jails/105".into(), mount_dir.path().to_string_lossy().into_owned());
        let metadata = Arc::new(MockMetadataBuilder { calls: Mutex::new(vec![]) });
        let network = Arc::new(MockNetworkSync);
        let engine = RestoreEngine::new(dataset.clone(), metadata.clone(), network);
        let req = RestoreRequest {
            remote_dataset: "zroot/bk/jails/105".into(),
            snapshot: "zelta_2026-02-18_12.00.00".into(),
            destination_dataset: "zroot/sylve/jails/105".into(),
        };
        engine.run(&req, &target(), &["tank/backups".to_string()]).await.unwrap();
        assert_eq!(metadata.calls.lock().as_slice(), &[GuestType::Jail]);
        assert_eq!(dataset.mounted.lock().as_slice(), &["zroot/sylve/jails/105".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_restore_to_same_destination_is_rejected() {
        let dataset = Arc::new(MockDataset::default());
        let metadata = Arc::new(MockMetadataBuilder { calls: Mutex::new(vec![]) });
        let network = Arc::new(MockNetworkSync);
        let engine = RestoreEngine::new(dataset, metadata, network);
        let _held = engine.acquire("zroot/sylve/jails/105").unwrap();
        let req = RestoreRequest {
            remote_dataset: "zroot/bk/jails/105".into(),
            snapshot: "zelta_2026-02-18_12.00.00".into(),
            destination_dataset: "zroot/sylve/jails/105".into(),
        };
        let err = engine.run(&req, &target(), &[]).await.unwrap_err();
        assert!(matches!(err, FleetError::Internal(_)));
    }
}
