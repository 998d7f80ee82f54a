// src/core/queue.rs

//! The durable, at-least-once work queue backing the backup/restore/
//! replication job handoff from schedulers to executors. FIFO per queue
//! name, backed by a `rusqlite` table rather than an external broker.

use crate::core::errors::FleetResult;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

pub struct DurableQueue {
    conn: Mutex<Connection>,
}

/// A dequeued message, holding onto its row id so the handler can `ack` it
/// (delete) once processing completes; if the process crashes mid-handle,
/// the row remains and is redelivered after `visible_at` next pop.
pub struct Delivery<T> {
    pub id: i64,
    pub payload: T,
    pub delivery_count: u32,
}

impl DurableQueue {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn enqueue<T: Serialize>(&self, queue_name: &str, payload: &T) -> FleetResult<i64> {
        let json = serde_json::to_string(payload)?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO durable_queue (queue_name, payload_json, enqueued_at, visible_at, delivery_count)
             VALUES (?1, ?2, ?3, ?3, 0)",
            params![queue_name, json, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pops the oldest visible message for `queue_name`, making it invisible
    /// for `lease_secs` so a crashed handler's message is redelivered
    /// rather than lost, then bumping its delivery count.
    pub fn dequeue<T: DeserializeOwned>(
        &self,
        queue_name: &str,
        lease_secs: i64,
    ) -> FleetResult<Option<Delivery<T>>> {
        let now = chrono::Utc::now();
        let conn = self.conn.lock();
        let row: Option<(i64, String, u32)> = conn
            .query_row(
                "SELECT id, payload_json, delivery_count FROM durable_queue
                 WHERE queue_name = ?1 AND visible_at <= ?2
                 ORDER BY id ASC LIMIT 1",
                params![queue_name, now.to_rfc3339()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;

        let Some((id, payload_json, delivery_count)) = row else {
            return Ok(None);
        };

        let next_visible = now + chrono::Duration::seconds(lease_secs);
        conn.execute(
            "UPDATE durable_queue SET visible_at = ?2, delivery_count = delivery_count + 1 WHERE id = ?1",
            params![id, next_visible.to_rfc3339()],
        )?;

        let payload = serde_json::from_str(&payload_json)?;
        Ok(Some(Delivery {
            id,
            payload,
            delivery_count: delivery_count + 1,
        }))
    }

    pub fn ack(&self, id: i64) -> FleetResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM durable_queue WHERE id = ?1", params![id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        job_id: i64,
    }

    fn queue() -> DurableQueue {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE durable_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                visible_at TEXT NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0
            );",
        )
        .unwrap();
        DurableQueue::new(conn)
    }

    #[test]
    fn fifo_within_a_queue_name() {
        let q = queue();
        q.enqueue("zelta-backup-run", &Payload { job_id: 1 }).unwrap();
        q.enqueue("zelta-backup-run", &Payload { job_id: 2 }).unwrap();
        let first: Delivery<Payload> = q.dequeue("zelta-backup-run", 60).unwrap().unwrap();
        assert_eq!(first.payload.job_id, 1);
        q.ack(first.id).unwrap();
        let second: Delivery<Payload> = q.dequeue("zelta-backup-run", 60).unwrap().unwrap();
        assert_eq!(second.payload.job_id, 2);
    }

    #[test]
    fn unacked_message_is_redelivered_after_lease_expiry() {
        let q = queue();
        q.enqueue("zelta-restore-run", &Payload { job_id: 9 }).unwrap();
        let first: Delivery<Payload> = q.dequeue("zelta-restore-run", -1).unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        let redelivered: Delivery<Payload> = q.dequeue("zelta-restore-run", 60).unwrap().unwrap();
        assert_eq!(redelivered.delivery_count, 2);
    }

    #[test]
    fn separate_queue_names_do_not_interleave() {
        let q = queue();
        q.enqueue("zelta-backup-run", &Payload { job_id: 1 }).unwrap();
        assert!(q
            .dequeue::<Payload>("zelta-replication-run", 60)
            .unwrap()
            .is_none());
    }
}
