// src/core/model/mod.rs

//! The cluster's replicated data model. Every struct in this module that is
//! not explicitly marked "node-local" is owned by the Raft FSM: the only
//! legal way to mutate it is through an applied [`crate::core::raft::command::Command`].

pub mod backup;
pub mod identity;
pub mod misc;
pub mod node;
pub mod replication;

pub use backup::{BackupEvent, BackupEventStatus, BackupJob, BackupMode, BackupTarget};
pub use identity::ClusterSshIdentity;
pub use misc::{DirectoryConfig, Note, S3Config};
pub use node::{Node, NodeStatus};
pub use replication::{
    FailbackMode, GuestType, ReplicationEvent, ReplicationEventStatus, ReplicationEventType,
    ReplicationLease, ReplicationPolicy, ReplicationPolicyTarget, SourceMode,
    REPLICATION_EVENT_RETENTION,
};
