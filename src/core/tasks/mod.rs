// src/core/tasks/mod.rs

//! This module contains all long-running background tasks that support the
//! cluster control plane: backup/replication cron ticks and their drain
//! workers, the failover controller tick, the node health reconciler, and
//! the `authorized_keys` sync for the embedded SSH server.

pub mod backup_tick;
pub mod failover_tick;
pub mod health_tick;
pub mod replication_tick;
pub mod ssh_identity_tick;

pub use backup_tick::{BackupDrainWorker, BackupMaintenanceTask, BackupTickTask};
pub use failover_tick::FailoverTickTask;
pub use health_tick::HealthTickTask;
pub use replication_tick::{ReplicationDrainWorker, ReplicationTickTask};
pub use ssh_identity_tick::SshIdentityReconcileTask;
