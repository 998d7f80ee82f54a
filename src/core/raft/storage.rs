// src/core/raft/storage.rs

//! `RaftStorage` impl backed by the node-local SQLite database. Log entries
//! and hard state survive a restart; the state machine itself is rebuilt by
//! replaying the log (or installing a snapshot) on startup.

use super::command::{Command, CommandResponse};
use super::fsm::FleetStateMachine;
use anyhow::{anyhow, Context, Result};
use async_raft::raft::{Entry, EntryPayload, MembershipConfig};
use async_raft::storage::{HardState, InitialState, Snapshot, SnapshotMeta};
use async_raft::{LogId, NodeId, RaftStorage};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::io::SeekFrom;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;

pub struct SqliteRaftStorage {
    node_id: NodeId,
    db: Mutex<Connection>,
    sm: RwLock<FleetStateMachine>,
    snapshot_dir: PathBuf,
    current_snapshot: RwLock<Option<SnapshotMeta>>,
    snapshot_counter: AtomicU64,
}

impl SqliteRaftStorage {
    pub fn open(node_id: NodeId, db_path: &std::path::Path, snapshot_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&snapshot_dir)
            .with_context(|| format!("creating raft snapshot dir {}", snapshot_dir.display()))?;
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening raft log db {}", db_path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS raft_log (
                log_index INTEGER PRIMARY KEY,
                term INTEGER NOT NULL,
                payload_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS raft_hard_state (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                current_term INTEGER NOT NULL,
                voted_for INTEGER
            );
            CREATE TABLE IF NOT EXISTS raft_membership (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                config_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS raft_meta (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                last_applied_term INTEGER NOT NULL,
                last_applied_index INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            node_id,
            db: Mutex::new(conn),
            sm: RwLock::new(FleetStateMachine::new()),
            snapshot_dir,
            current_snapshot: RwLock::new(None),
            snapshot_counter: AtomicU64::new(0),
        })
    }

    pub async fn state_machine_snapshot(&self) -> FleetStateMachine {
        self.sm.read().await.clone()
    }

    fn row_to_entry(term: u64, index: u64, payload_json: &str) -> Result<Entry<Command>> {
        let payload: EntryPayload<Command> = serde_json::from_str(payload_json)?;
        Ok(Entry {
            log_id: LogId { term, index },
            payload,
        })
    }
}

#[async_trait]
impl RaftStorage<Command, CommandResponse> for SqliteRaftStorage {
    type SnapshotData = File;
    type ShutdownError = anyhow::Error;

    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let db = self.db.lock();
        let row: Option<String> = db
            .query_row(
                "SELECT config_json FROM raft_membership WHERE id = 0",
                [],
                |r| r.get(0),
            )
            .optional()?;
        match row {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(MembershipConfig::new_initial(self.node_id)),
        }
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let db = self.db.lock();
        let hard_state: HardState = db
            .query_row(
                "SELECT current_term, voted_for FROM raft_hard_state WHERE id = 0",
                [],
                |r| {
                    Ok(HardState {
                        current_term: r.get(0)?,
                        voted_for: r.get(1)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default();

        let last_log: Option<(u64, u64)> = db
            .query_row(
                "SELECT term, log_index FROM raft_log ORDER BY log_index DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let last_log_id = last_log
            .map(|(term, index)| LogId { term, index })
            .unwrap_or(LogId { term: 0, index: 0 });

        let last_applied: Option<(u64, u64)> = db
            .query_row(
                "SELECT last_applied_term, last_applied_index FROM raft_meta WHERE id = 0",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let last_applied_log = last_applied
            .map(|(term, index)| LogId { term, index })
            .unwrap_or(LogId { term: 0, index: 0 });
        drop(db);

        let membership = self.get_membership_config().await?;

        Ok(InitialState {
            last_log_id,
            last_applied_log,
            hard_state,
            membership,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO raft_hard_state (id, current_term, voted_for) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET current_term = excluded.current_term, voted_for = excluded.voted_for",
            params![hs.current_term, hs.voted_for],
        )?;
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<Command>>> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(v) => *v,
            std::ops::Bound::Excluded(v) => v + 1,
            std::ops::Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            std::ops::Bound::Included(v) => Some(*v + 1),
            std::ops::Bound::Excluded(v) => Some(*v),
            std::ops::Bound::Unbounded => None,
        };

        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT term, log_index, payload_json FROM raft_log
             WHERE log_index >= ?1 AND (?2 IS NULL OR log_index < ?2)
             ORDER BY log_index ASC",
        )?;
        let rows = stmt.query_map(params![start, end], |r| {
            let term: u64 = r.get(0)?;
            let index: u64 = r.get(1)?;
            let payload_json: String = r.get(2)?;
            Ok((term, index, payload_json))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (term, index, payload_json) = row?;
            out.push(Self::row_to_entry(term, index, &payload_json)?);
        }
        Ok(out)
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<Command>>> {
        let db = self.db.lock();
        let row: Option<(u64, String)> = db
            .query_row(
                "SELECT term, payload_json FROM raft_log WHERE log_index = ?1",
                params![log_index],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((term, payload_json)) => Ok(Some(Self::row_to_entry(term, log_index, &payload_json)?)),
            None => Ok(None),
        }
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        let db = self.db.lock();
        let last_log: Option<(u64, u64)> = db
            .query_row(
                "SELECT term, log_index FROM raft_log ORDER BY log_index DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if let Some((term, index)) = last_log {
            return Ok(LogId { term, index });
        }
        drop(db);
        let db = self.db.lock();
        let applied: Option<(u64, u64)> = db
            .query_row(
                "SELECT last_applied_term, last_applied_index FROM raft_meta WHERE id = 0",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(applied
            .map(|(term, index)| LogId { term, index })
            .unwrap_or(LogId { term: 0, index: 0 }))
    }

    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<()> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(v) => *v,
            std::ops::Bound::Excluded(v) => v + 1,
            std::ops::Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            std::ops::Bound::Included(v) => Some(*v + 1),
            std::ops::Bound::Excluded(v) => Some(*v),
            std::ops::Bound::Unbounded => None,
        };
        let db = self.db.lock();
        db.execute(
            "DELETE FROM raft_log WHERE log_index >= ?1 AND (?2 IS NULL OR log_index < ?2)",
            params![start, end],
        )?;
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<Command>]) -> Result<()> {
        let db = self.db.lock();
        for entry in entries {
            let payload_json = serde_json::to_string(&entry.payload)?;
            if let EntryPayload::ConfigChange(change) = &entry.payload {
                db.execute(
                    "INSERT INTO raft_membership (id, config_json) VALUES (0, ?1)
                     ON CONFLICT(id) DO UPDATE SET config_json = excluded.config_json",
                    params![serde_json::to_string(&change.membership)?],
                )?;
            }
            db.execute(
                "INSERT INTO raft_log (log_index, term, payload_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(log_index) DO UPDATE SET term = excluded.term, payload_json = excluded.payload_json",
                params![entry.log_id.index, entry.log_id.term, payload_json],
            )?;
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry<Command>]) -> Result<Vec<CommandResponse>> {
        let mut sm = self.sm.write().await;
        let mut out = Vec::with_capacity(entries.len());
        let mut last_applied = LogId { term: 0, index: 0 };
        for entry in entries {
            last_applied = entry.log_id;
            let resp = match &entry.payload {
                EntryPayload::Blank => CommandResponse::ok(),
                EntryPayload::Normal(normal) => sm.apply(&normal.data),
                EntryPayload::ConfigChange(_) => CommandResponse::ok(),
                EntryPayload::PurgedMarker => CommandResponse::ok(),
            };
            out.push(resp);
        }
        drop(sm);

        let db = self.db.lock();
        db.execute(
            "INSERT INTO raft_meta (id, last_applied_term, last_applied_index) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET last_applied_term = excluded.last_applied_term, last_applied_index = excluded.last_applied_index",
            params![last_applied.term, last_applied.index],
        )?;
        Ok(out)
    }

    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let sm = self.sm.read().await.clone();
        let (last_applied_term, last_applied_index) = {
            let db = self.db.lock();
            db.query_row(
                "SELECT last_applied_term, last_applied_index FROM raft_meta WHERE id = 0",
                [],
                |r| Ok((r.get::<_, u64>(0)?, r.get::<_, u64>(1)?)),
            )
            .optional()?
            .unwrap_or((0, 0))
        };
        let membership = self.get_membership_config().await?;

        let snapshot_id = self.snapshot_counter.fetch_add(1, Ordering::SeqCst);
        let path = self
            .snapshot_dir
            .join(format!("snapshot-{last_applied_index}-{snapshot_id}.json"));
        let bytes = serde_json::to_vec(&sm)?;
        tokio::fs::write(&path, &bytes).await?;

        let meta = SnapshotMeta {
            last_log_id: LogId {
                term: last_applied_term,
                index: last_applied_index,
            },
            membership,
            snapshot_id: snapshot_id.to_string(),
        };
        *self.current_snapshot.write().await = Some(meta.clone());

        let file = File::open(&path).await?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(file),
        })
    }

    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        let path = self.snapshot_dir.join("incoming.json");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Box::new(file))
    }

    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        mut snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        snapshot.seek(SeekFrom::Start(0)).await?;
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut *snapshot, &mut bytes).await?;
        let restored: FleetStateMachine = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow!("decoding installed snapshot: {e}"))?;

        *self.sm.write().await = restored;

        let final_path = self
            .snapshot_dir
            .join(format!("snapshot-{}-installed.json", meta.last_log_id.index));
        tokio::fs::write(&final_path, &bytes).await?;

        {
            let db = self.db.lock();
            db.execute(
                "DELETE FROM raft_log WHERE log_index <= ?1",
                params![meta.last_log_id.index],
            )?;
            db.execute(
                "INSERT INTO raft_meta (id, last_applied_term, last_applied_index) VALUES (0, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET last_applied_term = excluded.last_applied_term, last_applied_index = excluded.last_applied_index",
                params![meta.last_log_id.term, meta.last_log_id.index],
            )?;
            db.execute(
                "INSERT INTO raft_membership (id, config_json) VALUES (0, ?1)
                 ON CONFLICT(id) DO UPDATE SET config_json = excluded.config_json",
                params![serde_json::to_string(&meta.membership)?],
            )?;
        }

        *self.current_snapshot.write().await = Some(meta.clone());
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        let meta = self.current_snapshot.read().await.clone();
        let meta = match meta {
            Some(m) => m,
            None => return Ok(None),
        };
        let path = self
            .snapshot_dir
            .join(format!("snapshot-{}-installed.json", meta.last_log_id.index));
        let path = if path.exists() {
            path
        } else {
            self.snapshot_dir
                .join(format!("snapshot-{}-0.json", meta.last_log_id.index))
        };
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).await?;
        Ok(Some(Snapshot {
            meta,
            snapshot: Box::new(file),
        }))
    }
}
