// src/core/mod.rs

//! The central module containing the core logic and data structures of the
//! fleet control plane: Raft-replicated cluster state, the ZFS backup and
//! restore engines, HA replication with lease-based guest ownership, node
//! health reconciliation, and the embedded SSH transport that moves bytes
//! between nodes.

pub mod backup;
pub mod capability;
pub mod dataset;
pub mod errors;
pub mod failover;
pub mod guest;
pub mod health;
pub mod ids;
pub mod jwt;
pub mod local_db;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod raft;
pub mod replication;
pub mod restore;
pub mod ssh_exec;
pub mod ssh_server;
pub mod tasks;

pub use errors::{FleetError, FleetResult};
pub use raft::command::Command;
