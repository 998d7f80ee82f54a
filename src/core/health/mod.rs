// src/core/health/mod.rs

//! The node health reconciler (component B).

pub mod reconciler;

pub use reconciler::{ClusterMember, HealthReconciler, HttpPeerInfoSource, PeerInfoSource, PeerSnapshot};
