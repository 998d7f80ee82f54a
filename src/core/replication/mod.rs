// src/core/replication/mod.rs

//! The HA replication engine (component F): policies replicate a guest's
//! dataset to one or more peers on a cron tick, namespaced apart from
//! ordinary backups. [`crate::core::failover`] owns lease renewal and
//! owner failover; this module owns the data-moving side.

pub mod run;
pub mod scheduler;

pub use run::ReplicationRunner;
pub use scheduler::{ReplicationRunMessage, ReplicationScheduler, REPLICATION_QUEUE_NAME};
