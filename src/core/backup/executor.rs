// src/core/backup/executor.rs

//! Runs one `BackupJob` end to end: SSH key materialisation, dataset
//! resolution, send, divergence handling, prune, event finalisation. One
//! instance is shared across ticks; `running` is the in-process mutex that
//! keeps at most one executor per job id active locally (the scheduler
//! already ensures at most one *node* runs a given job).

use crate::core::backup::classify::{classify_backup_output, rotate_indicates_not_a_replica};
use crate::core::backup::suffix::{auto_dest_suffix, is_snapshot_name};
use crate::core::capability::GuestLifecycle;
use crate::core::dataset::{Dataset, PruneOptions, SendOptions, SshEndpoint};
use crate::core::errors::{FleetError, FleetResult};
use crate::core::local_db::LocalDb;
use crate::core::model::{BackupEvent, BackupEventStatus, BackupJob, BackupJobStatus, BackupMode, BackupTarget, GuestType};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

const MAX_SEND_RETRIES: u32 = 2;

pub struct BackupExecutor<D: Dataset, G: GuestLifecycle> {
    dataset: Arc<D>,
    guests: Arc<G>,
    local_db: Arc<LocalDb>,
    running: Mutex<HashSet<i64>>,
}

/// A guard releasing a job's in-process run slot when dropped, including on
/// an early `?` return.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<i64>>,
    job_id: i64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.job_id);
    }
}

impl<D: Dataset, G: GuestLifecycle> BackupExecutor<D, G> {
    pub fn new(dataset: Arc<D>, guests: Arc<G>, local_db: Arc<LocalDb>) -> Self {
        Self {
            dataset,
            guests,
            local_db,
            running: Mutex::new(HashSet::new()),
        }
    }

    fn acquire(&self, job_id: i64) -> FleetResult<RunGuard<'_>> {
        let mut running = self.running.lock();
        if !running.insert(job_id) {
            return Err(FleetError::BackupJobAlreadyRunning);
        }
        drop(running);
        Ok(RunGuard {
            running: &self.running,
            job_id,
        })
    }

    /// Runs `job` against `target`, writing one `BackupEvent` per resolved
    /// source dataset and returning the job's updated
    /// `{last_status, last_error}` pair for the caller to persist back
    /// through Raft. Does not itself touch `next_run_at`; the scheduler
    /// owns that field.
    ///
    /// `enabled_backup_roots` is the set of every enabled `BackupTarget`'s
    /// `backup_root`, used to exclude backup-destination datasets from
    /// VM-mode's local enumeration so a node never ingests its own backups.
    pub async fn run(
        &self,
        job: &BackupJob,
        target: &BackupTarget,
        enabled_backup_roots: &[String],
    ) -> FleetResult<(BackupJobStatus, Option<String>)> {
        let _guard = self.acquire(job.id)?;

        if !target.enabled {
            return Err(FleetError::BackupTargetDisabled);
        }
        let key_path = materialise_key(target)?;
        let endpoint = SshEndpoint {
            user: "root".into(),
            host: target.ssh_host.clone(),
            port: target.ssh_port,
            key_path,
        };

        let sources = self.resolve_sources(job, enabled_backup_roots).await?;
        if sources.is_empty() {
            return Err(FleetError::InvalidMode);
        }

        let mut status = BackupJobStatus::Success;
        let mut error = None;
        for source in &sources {
            let (s, e) = self.run_one_source(job, &endpoint, target, source).await?;
            if s == BackupJobStatus::Failed {
                status = BackupJobStatus::Failed;
                error = e;
            }
        }
        Ok((status, error))
    }

    /// Resolves the dataset(s) this job actually backs up. Dataset/jail
    /// modes have exactly one source dataset on record; VM mode has none —
    /// instead `job.resolved_source()` names the parent under which every
    /// VM's dataset lives (e.g. `<pool>/sylve/virtual-machines`), and the
    /// real sources are discovered by listing it, excluding anything that
    /// lives inside an enabled backup root to prevent self-ingest.
    async fn resolve_sources(&self, job: &BackupJob, enabled_backup_roots: &[String]) -> FleetResult<Vec<String>> {
        let Some(source) = job.resolved_source() else {
            return Err(FleetError::InvalidMode);
        };
        if job.mode != BackupMode::Vm {
            return Ok(vec![source.to_string()]);
        }
        let children = self.dataset.list_local_datasets(source).await?;
        Ok(children
            .into_iter()
            .filter(|d| !enabled_backup_roots.iter().any(|root| is_within_root(d, root)))
            .collect())
    }

    async fn run_one_source(
        &self,
        job: &BackupJob,
        endpoint: &SshEndpoint,
        target: &BackupTarget,
        source: &str,
    ) -> FleetResult<(BackupJobStatus, Option<String>)> {
        let dest_suffix = job
            .dest_suffix
            .clone()
            .unwrap_or_else(|| match job.mode {
                BackupMode::Vm => source.to_string(),
                BackupMode::Dataset | BackupMode::Jail => auto_dest_suffix(source),
            });
        let dest_path = format!("{}/{}", target.backup_root, dest_suffix);

        let event_id = self.local_db.next_backup_id()?;
        let mut event = BackupEvent {
            id: event_id,
            job_id: Some(job.id),
            mode: job.mode,
            status: BackupEventStatus::Running,
            source_dataset: source.to_string(),
            target_endpoint: format!("{}:{}", endpoint.host_spec(), dest_path),
            started_at: chrono::Utc::now(),
            completed_at: None,
            output: String::new(),
            error: None,
        };
        self.local_db.insert_backup_event(&event)?;

        let guest = job.mode.ne(&BackupMode::Dataset).then(|| guest_ref(job.mode, source));

        if job.stop_before_backup {
            if let Some((guest_type, guest_id)) = guest {
                if let Err(e) = self.guests.stop(guest_type, guest_id).await {
                    self.append(&mut event, &format!("stop_before_backup failed (non-fatal): {e}"))?;
                }
            }
        }

        let outcome = self.send_with_retries(source, endpoint, &dest_path, &mut event).await;

        if job.stop_before_backup {
            if let Some((guest_type, guest_id)) = guest {
                if let Err(e) = self.guests.start(guest_type, guest_id).await {
                    self.append(&mut event, &format!("guest restart failed (non-fatal): {e}"))?;
                }
            }
        }

        let (status, error) = match outcome {
            Ok(()) => {
                if job.prune_keep_last > 0 && job.mode != BackupMode::Vm {
                    if let Err(e) = self.prune(job, source, endpoint, &dest_path, &mut event).await {
                        self.append(&mut event, &format!("prune failed (non-fatal): {e}"))?;
                    }
                }
                (BackupJobStatus::Success, None)
            }
            Err(e) => (BackupJobStatus::Failed, Some(e.to_string())),
        };

        self.local_db.finalize_event(
            event_id,
            if status == BackupJobStatus::Success {
                BackupEventStatus::Success
            } else {
                BackupEventStatus::Failed
            },
            error.as_deref(),
            chrono::Utc::now(),
        )?;

        Ok((status, error))
    }

    fn append(&self, event: &mut BackupEvent, chunk: &str) -> FleetResult<()> {
        event.append_output(chunk);
        self.local_db.append_event_output(event.id, chunk)
    }

    async fn send_with_retries(
        &self,
        source: &str,
        endpoint: &SshEndpoint,
        dest_path: &str,
        event: &mut BackupEvent,
    ) -> FleetResult<()> {
        let mut attempt = 0u32;
        loop {
            let outcome = self.dataset.send(source, endpoint, dest_path, &SendOptions::default()).await?;
            self.append(event, &outcome.combined())?;
            let classified = classify_backup_output(&outcome.combined());
            if classified.is_success() {
                return Ok(());
            }
            let Some(err) = classified.error_code() else {
                return Ok(());
            };
            let can_rotate = matches!(err, FleetError::BackupTargetDiverged) && attempt < MAX_SEND_RETRIES;
            if !can_rotate {
                return Err(err);
            }
            attempt += 1;

            let rotate_outcome = self.dataset.rotate(source, endpoint, dest_path, None).await?;
            self.append(event, &rotate_outcome.combined())?;
            if rotate_indicates_not_a_replica(&rotate_outcome.combined()) {
                let renamed = format!("{dest_path}.pre_sylve_{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
                self.dataset.rename(dest_path, &renamed, Some(endpoint)).await?;
                self.append(event, &format!("renamed diverged target to {renamed}"))?;
            }
        }
    }

    async fn prune(
        &self,
        job: &BackupJob,
        source: &str,
        endpoint: &SshEndpoint,
        dest_path: &str,
        event: &mut BackupEvent,
    ) -> FleetResult<()> {
        let opts = PruneOptions {
            keep_snap_num: job.prune_keep_last,
            keep_snap_days: 0,
            swap_args: false,
        };
        let outcome = self.dataset.prune(source, endpoint, dest_path, &opts).await?;
        self.append(event, &outcome.combined())?;
        for line in &outcome.lines {
            if is_snapshot_name(line.trim()) {
                self.dataset.destroy(line.trim(), None).await?;
            }
        }

        if job.prune_target {
            let swapped = PruneOptions { swap_args: true, ..opts };
            let target_outcome = self.dataset.prune(source, endpoint, dest_path, &swapped).await?;
            self.append(event, &target_outcome.combined())?;
            let mut destroyed_any = false;
            for line in &target_outcome.lines {
                if is_snapshot_name(line.trim()) {
                    self.dataset.destroy(line.trim(), Some(endpoint)).await?;
                    destroyed_any = true;
                }
            }
            if !destroyed_any {
                let mut snaps = self.dataset.list_snapshots(dest_path, Some(endpoint)).await?;
                snaps.sort_by_key(|s| s.created_at);
                let keep = job.prune_keep_last as usize + 1;
                if snaps.len() > keep {
                    for stale in &snaps[..snaps.len() - keep] {
                        let full = format!("{dest_path}@{}", stale.short_name);
                        self.dataset.destroy(&full, Some(endpoint)).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_within_root(dataset: &str, root: &str) -> bool {
    dataset == root || dataset.starts_with(&format!("{root}/"))
}

fn guest_ref(mode: BackupMode, source: &str) -> (GuestType, u64) {
    let guest_type = match mode {
        BackupMode::Jail => GuestType::Jail,
        _ => GuestType::Vm,
    };
    let id = source
        .rsplit('/')
        .next()
        .and_then(|leaf| leaf.parse::<u64>().ok())
        .unwrap_or(0);
    (guest_type, id)
}

/// Writes `target.ssh_key` out to a node-local key file if the target
/// carries key material inline rather than a path, so every SSH invocation
/// downstream can use a uniform `-i <path>`.
pub fn materialise_key(target: &BackupTarget) -> FleetResult<Option<String>> {
    if let Some(path) = &target.ssh_key_path {
        return Ok(Some(path.clone()));
    }
    let Some(key) = &target.ssh_key else {
        return Ok(None);
    };
    let dir = std::env::temp_dir().join("fleetkeeper-ssh-keys");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("target-{}.key", target.id));
    {
        let mut file = std::fs::File::create(&path)?;
        file.write_all(key.as_bytes())?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(Some(path.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capability::mock::MockGuestLifecycle;
    use crate::core::dataset::mock::MockDataset;
    use crate::core::dataset::CommandOutcome;

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

    fn job() -> BackupJob {
        BackupJob {
            id: 10,
            name: "daily-105".into(),
            target_id: 1,
            runner_node_id: None,
            mode: BackupMode::Jail,
            source_dataset: None,
            jail_root_dataset: Some("zroot/sylve/jails/105".into()),
            dest_suffix: None,
            cron_expr: "0 0 * * * *".into(),
            enabled: true,
            force: false,
            with_intermediates: false,
            prune_keep_last: 0,
            prune_target: false,
            stop_before_backup: false,
            next_run_at: None,
            last_run_at: None,
            last_status: None,
            last_error: None,
        }
    }

    fn temp_local_db() -> Arc<LocalDb> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.sqlite");
        std::mem::forget(dir);
        Arc::new(LocalDb::open(&path).unwrap())
    }

    #[tokio::test]
    async fn up_to_date_send_finalises_success() {
        let dataset = Arc::new(MockDataset::default());
        let guests = Arc::new(MockGuestLifecycle::default());
        let db = temp_local_db();
        let exec = BackupExecutor::new(dataset, guests, db);
        let (status, error) = exec.run(&job(), &target(), &[]).await.unwrap();
        assert_eq!(status, BackupJobStatus::Success);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn divergence_auto_rotates_then_succeeds() {
        let dataset = Arc::new(MockDataset::default());
        *dataset.send_outcomes.lock() = vec![
            CommandOutcome {
                lines: vec!["error: target has diverged from source".into()],
                exit_success: true,
            },
            CommandOutcome {
                lines: vec!["up-to-date".into()],
                exit_success: true,
            },
        ];
        *dataset.rotate_outcomes.lock() = vec![CommandOutcome {
            lines: vec!["rotated ok".into()],
            exit_success: true,
        }];
        let guests = Arc::new(MockGuestLifecycle::default());
        let db = temp_local_db();
        let exec = BackupExecutor::new(dataset, guests, db);
        let (status, _) = exec.run(&job(), &target(), &[]).await.unwrap();
        assert_eq!(status, BackupJobStatus::Success);
    }

    #[tokio::test]
    async fn rotate_not_a_replica_renames_target_before_retry() {
        let dataset = Arc::new(MockDataset::default());
        *dataset.send_outcomes.lock() = vec![
            CommandOutcome {
                lines: vec!["error: target has diverged from source".into()],
                exit_success: true,
            },
            CommandOutcome {
                lines: vec!["up-to-date".into()],
                exit_success: true,
            },
        ];
        *dataset.rotate_outcomes.lock() = vec![CommandOutcome {
            lines: vec!["dest is not a replica of source".into()],
            exit_success: true,
        }];
        let guests = Arc::new(MockGuestLifecycle::default());
        let db = temp_local_db();
        let exec = BackupExecutor::new(dataset.clone(), guests, db);
        let (status, _) = exec.run(&job(), &target(), &[]).await.unwrap();
        assert_eq!(status, BackupJobStatus::Success);
        assert_eq!(dataset.renamed.lock().len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_error_fails_the_job() {
        let dataset = Arc::new(MockDataset::default());
        *dataset.send_outcomes.lock() = vec![CommandOutcome {
            lines: vec!["no such dataset: source not found".into()],
            exit_success: true,
        }];
        let guests = Arc::new(MockGuestLifecycle::default());
        let db = temp_local_db();
        let exec = BackupExecutor::new(dataset, guests, db);
        let (status, error) = exec.run(&job(), &target(), &[]).await.unwrap();
        assert_eq!(status, BackupJobStatus::Failed);
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn concurrent_run_of_same_job_is_rejected() {
        let dataset = Arc::new(MockDataset::default());
        let guests = Arc::new(MockGuestLifecycle::default());
        let db = temp_local_db();
        let exec = Arc::new(BackupExecutor::new(dataset, guests, db));
        let _guard = exec.acquire(job().id).unwrap();
        let err = exec.run(&job(), &target(), &[]).await.unwrap_err();
        assert!(matches!(err, FleetError::BackupJobAlreadyRunning));
    }
}
