// src/core/backup/mod.rs

//! The ZFS backup engine (components C/D): scheduler ticks enqueue jobs
//! onto a durable queue, the executor drains it and drives `zelta`/`zfs`
//! through the [`crate::core::dataset::Dataset`] capability.

pub mod classify;
pub mod executor;
pub mod lineage;
pub mod scheduler;
pub mod suffix;

pub use classify::{classify_backup_output, rotate_indicates_not_a_replica, BackupOutcome};
pub use executor::{materialise_key, BackupExecutor};
pub use lineage::{classify as classify_lineage, resolve_snapshot_owner, LineageKind};
pub use scheduler::{BackupRunMessage, BackupScheduler, BACKUP_QUEUE_NAME};
pub use suffix::{auto_dest_suffix, is_snapshot_name};
