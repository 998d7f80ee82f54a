// src/core/restore/mod.rs

//! The restore engine (component E): pulls a remote snapshot back onto this
//! node and reconciles guest metadata. Two callers share this one pipeline —
//! a scheduled restore tied to an existing `BackupJob`, and a free-form
//! restore-from-target picked by `(target_id, remote_dataset, snapshot,
//! destination_dataset)` — so both are just different ways of building a
//! [`RestoreRequest`].

pub mod engine;

pub use engine::{fnv1a32, RestoreEngine, RestoreRequest};
