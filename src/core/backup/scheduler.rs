// src/core/backup/scheduler.rs

//! Two independent ticking loops: the 30 s scheduling tick (cron evaluation,
//! `next_run_at` advancement, enqueue) and a 5-minute ticker that
//! re-materialises SSH keys and sweeps stale `running` events. A separate
//! worker tick drains the durable queue and hands jobs to the executor.

use crate::core::backup::executor::{materialise_key, BackupExecutor};
use crate::core::capability::GuestLifecycle;
use crate::core::dataset::Dataset;
use crate::core::errors::{FleetError, FleetResult};
use crate::core::local_db::LocalDb;
use crate::core::model::{BackupJob, BackupJobAction, BackupTarget};
use crate::core::queue::DurableQueue;
use crate::core::raft::command::Command;
use crate::core::raft::router::CommandRouter;
use crate::core::raft::storage::SqliteRaftStorage;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

pub const BACKUP_QUEUE_NAME: &str = "zelta-backup-run";
const BACKUP_LEASE_SECS: i64 = 900;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRunMessage {
    pub job_id: i64,
}

pub struct BackupScheduler<D: Dataset, G: GuestLifecycle> {
    local_node_id: uuid::Uuid,
    storage: Arc<SqliteRaftStorage>,
    router: Arc<CommandRouter>,
    queue: Arc<DurableQueue>,
    local_db: Arc<LocalDb>,
    executor: Arc<BackupExecutor<D, G>>,
}

impl<D: Dataset, G: GuestLifecycle> BackupScheduler<D, G> {
    pub fn new(
        local_node_id: uuid::Uuid,
        storage: Arc<SqliteRaftStorage>,
        router: Arc<CommandRouter>,
        queue: Arc<DurableQueue>,
        local_db: Arc<LocalDb>,
        executor: Arc<BackupExecutor<D, G>>,
    ) -> Self {
        Self {
            local_node_id,
            storage,
            router,
            queue,
            local_db,
            executor,
        }
    }

    fn is_local_runner(&self, job: &BackupJob, raft_leader_is_local: bool) -> bool {
        match job.runner_node_id {
            Some(id) => id == self.local_node_id,
            None => raft_leader_is_local,
        }
    }

    /// The 30 s tick: for each enabled job this node runs, advance
    /// `next_run_at` and enqueue exactly one run per occurrence crossed.
    pub async fn tick(&self) -> FleetResult<()> {
        let sm = self.storage.state_machine_snapshot().await;
        let leader = self.router.current_leader().await;
        let raft_leader_is_local = self.router.is_local_leader(leader);
        let now = chrono::Utc::now();

        for job in sm.backup_jobs.values() {
            if !job.enabled || job.cron_expr.trim().is_empty() {
                continue;
            }
            if !self.is_local_runner(job, raft_leader_is_local) {
                continue;
            }
            let schedule = match cron::Schedule::from_str(&job.cron_expr) {
                Ok(s) => s,
                Err(_) => continue,
            };

            match job.next_run_at {
                None => {
                    if let Some(next) = schedule.upcoming(chrono::Utc).next() {
                        let mut updated = job.clone();
                        updated.next_run_at = Some(next);
                        self.router
                            .apply(Command::BackupJob(BackupJobAction::Update(updated)))
                            .await?;
                    }
                }
                Some(next_run_at) if now >= next_run_at => {
                    let mut updated = job.clone();
                    updated.next_run_at = schedule.after(&now).next();
                    self.router
                        .apply(Command::BackupJob(BackupJobAction::Update(updated)))
                        .await?;
                    self.queue
                        .enqueue(BACKUP_QUEUE_NAME, &BackupRunMessage { job_id: job.id })?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// The 5-minute maintenance ticker: re-materialise every target's SSH
    /// key file and sweep events stuck in `running`.
    pub async fn maintenance_tick(&self) -> FleetResult<()> {
        let sm = self.storage.state_machine_snapshot().await;
        for target in sm.backup_targets.values() {
            if target.enabled {
                materialise_key(target)?;
            }
        }
        self.local_db.sweep_stale_running_events(chrono::Utc::now())?;
        Ok(())
    }

    /// Pops one message off the durable queue (if any) and runs it to
    /// completion, persisting the job's `{last_run_at,last_status,last_error}`
    /// back through Raft. Returns `Ok(false)` when the queue was empty.
    pub async fn drain_one(&self) -> FleetResult<bool> {
        let delivery = self
            .queue
            .dequeue::<BackupRunMessage>(BACKUP_QUEUE_NAME, BACKUP_LEASE_SECS)?;
        let Some(delivery) = delivery else {
            return Ok(false);
        };

        let sm = self.storage.state_machine_snapshot().await;
        let Some(job) = sm.backup_jobs.get(&delivery.payload.job_id).cloned() else {
            self.queue.ack(delivery.id)?;
            return Ok(true);
        };
        let Some(target) = sm.backup_targets.get(&job.target_id).cloned() else {
            self.queue.ack(delivery.id)?;
            return Ok(true);
        };

        let enabled_backup_roots: Vec<String> = sm
            .backup_targets
            .values()
            .filter(|t| t.enabled)
            .map(|t| t.backup_root.clone())
            .collect();

        let run_result = self.run_and_persist(&job, &target, &enabled_backup_roots).await;
        self.queue.ack(delivery.id)?;
        run_result?;
        Ok(true)
    }

    async fn run_and_persist(&self, job: &BackupJob, target: &BackupTarget, enabled_backup_roots: &[String]) -> FleetResult<()> {
        let (status, error) = match self.executor.run(job, target, enabled_backup_roots).await {
            Ok(outcome) => outcome,
            Err(FleetError::BackupJobAlreadyRunning) => return Ok(()),
            Err(e) => (crate::core::model::BackupJobStatus::Failed, Some(e.to_string())),
        };
        let mut updated = job.clone();
        updated.last_run_at = Some(chrono::Utc::now());
        updated.last_status = Some(status);
        updated.last_error = error;
        self.router
            .apply(Command::BackupJob(BackupJobAction::Update(updated)))
            .await?;
        Ok(())
    }
}
