// src/core/failover/mod.rs

//! HA failover (components F/G): lease renewal and owner failover
//! (leader-only), plus self-fencing (every node, every tick).

pub mod controller;
pub mod selffence;

pub use controller::FailoverController;
pub use selffence::run_self_fence_tick;
