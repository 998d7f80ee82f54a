// src/core/raft/mod.rs

//! The replicated config layer: a single Raft group, one command log, and
//! one deterministic state machine shared by every other subsystem.

pub mod command;
pub mod fsm;
pub mod network;
pub mod router;
pub mod storage;

pub use command::{Command, CommandResponse};
pub use fsm::{FleetStateMachine, IdKind};
pub use network::{HttpRaftNetwork, PeerRegistry};
pub use router::{CommandRouter, FleetRaft, APPLY_TIMEOUT};
pub use storage::SqliteRaftStorage;

use crate::core::errors::FleetResult;
use std::sync::Arc;

/// Allocates a fresh id of `kind`, retrying against the live FSM snapshot.
/// Returns `unable_to_allocate_unique_id` after the configured retry
/// budget, per [`crate::core::ids`].
pub async fn allocate_id(storage: &Arc<SqliteRaftStorage>, kind: IdKind) -> FleetResult<i64> {
    let sm = storage.state_machine_snapshot().await;
    crate::core::ids::allocate(sm.next_id(kind))
        .ok_or(crate::core::errors::FleetError::UnableToAllocateUniqueId)
}
