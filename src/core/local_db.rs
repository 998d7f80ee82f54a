// src/core/local_db.rs

//! The node-local SQLite store: `BackupEvent` history and the durable
//! queue tables. Raft-owned state never lands here — see
//! [`crate::core::raft::storage`] for that.

use crate::core::errors::FleetResult;
use crate::core::model::{BackupEvent, BackupEventStatus, BackupMode};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

pub struct LocalDb {
    conn: Mutex<Connection>,
}

impl LocalDb {
    pub fn open(path: &Path) -> FleetResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS backup_events (
                id INTEGER PRIMARY KEY,
                job_id INTEGER,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                source_dataset TEXT NOT NULL,
                target_endpoint TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                output TEXT NOT NULL DEFAULT '',
                error TEXT
            );
            CREATE TABLE IF NOT EXISTS durable_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                visible_at TEXT NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS durable_queue_pop_idx
                ON durable_queue (queue_name, visible_at, id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Retries a DB-locked write up to 3 times with `100ms * attempt`
    /// back-off, matching the node health reconciler's persistence policy.
    pub fn with_retry<T>(&self, mut f: impl FnMut(&Connection) -> rusqlite::Result<T>) -> FleetResult<T> {
        let conn = self.conn.lock();
        let mut attempt = 0u32;
        loop {
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_locked(&e) && attempt < 3 => {
                    attempt += 1;
                    std::thread::sleep(std::time::Duration::from_millis(100 * attempt as u64));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn insert_backup_event(&self, event: &BackupEvent) -> FleetResult<i64> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO backup_events
                 (id, job_id, mode, status, source_dataset, target_endpoint, started_at, completed_at, output, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.id,
                    event.job_id,
                    mode_str(event.mode),
                    status_str(event.status),
                    event.source_dataset,
                    event.target_endpoint,
                    event.started_at.to_rfc3339(),
                    event.completed_at.map(|t| t.to_rfc3339()),
                    event.output,
                    event.error,
                ],
            )
        })?;
        Ok(event.id)
    }

    pub fn append_event_output(&self, id: i64, chunk: &str) -> FleetResult<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE backup_events SET output = output || ?2 || char(10) WHERE id = ?1",
                params![id, chunk],
            )
        })?;
        Ok(())
    }

    pub fn finalize_event(
        &self,
        id: i64,
        status: BackupEventStatus,
        error: Option<&str>,
        completed_at: chrono::DateTime<chrono::Utc>,
    ) -> FleetResult<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE backup_events SET status = ?2, error = ?3, completed_at = ?4 WHERE id = ?1",
                params![id, status_str(status), error, completed_at.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Sweeps `running` events older than 15 minutes to `interrupted`,
    /// matching the error code the restart-recovery path stamps.
    pub fn sweep_stale_running_events(&self, now: chrono::DateTime<chrono::Utc>) -> FleetResult<usize> {
        let cutoff = (now - chrono::Duration::minutes(15)).to_rfc3339();
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE backup_events SET status = 'interrupted', error = 'process_crashed_or_restarted', completed_at = ?2
                 WHERE status = 'running' AND started_at < ?1",
                params![cutoff, now.to_rfc3339()],
            )
        })
    }

    pub fn next_backup_id(&self) -> FleetResult<i64> {
        self.with_retry(|conn| {
            conn.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM backup_events", [], |r| r.get(0))
        })
    }
}

fn is_locked(e: &rusqlite::Error) -> bool {
    e.to_string().to_lowercase().contains("database is locked")
}

fn mode_str(mode: BackupMode) -> &'static str {
    match mode {
        BackupMode::Dataset => "dataset",
        BackupMode::Jail => "jail",
        BackupMode::Vm => "vm",
    }
}

fn status_str(status: BackupEventStatus) -> &'static str {
    match status {
        BackupEventStatus::Running => "running",
        BackupEventStatus::Success => "success",
        BackupEventStatus::Failed => "failed",
        BackupEventStatus::Interrupted => "interrupted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> LocalDb {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetkeeper.sqlite");
        std::mem::forget(dir);
        LocalDb::open(&path).unwrap()
    }

    #[test]
    fn sweeps_stale_running_events() {
        let db = temp_db();
        let now = chrono::Utc::now();
        let event = BackupEvent {
            id: 1,
            job_id: Some(1),
            mode: BackupMode::Dataset,
            status: BackupEventStatus::Running,
            source_dataset: "zroot/data".into(),
            target_endpoint: "nas:tank/backups/data".into(),
            started_at: now - chrono::Duration::minutes(20),
            completed_at: None,
            output: String::new(),
            error: None,
        };
        db.insert_backup_event(&event).unwrap();
        let swept = db.sweep_stale_running_events(now).unwrap();
        assert_eq!(swept, 1);
    }
}
