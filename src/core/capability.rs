// src/core/capability.rs

//! Narrow capability interfaces that keep the restore and replication
//! engines free of hypervisor/container specifics. Nothing in `core`
//! spawns a jail or a VM directly; it calls through one of these.

use crate::core::errors::FleetResult;
use crate::core::model::GuestType;
use async_trait::async_trait;
use serde_json::Value;

/// Start/stop/liveness for a single guest, independent of jail vs VM.
#[async_trait]
pub trait GuestLifecycle: Send + Sync {
    async fn start(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<()>;
    async fn stop(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<()>;
    async fn is_inactive(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<bool>;
}

/// Builds (or rebuilds) a guest's own config object from the on-disk
/// metadata pulled alongside a restored dataset (`jail.json` / `vm.json`).
#[async_trait]
pub trait GuestMetadataBuilder: Send + Sync {
    async fn create_config(&self, guest_type: GuestType, metadata: &Value) -> FleetResult<()>;
}

/// Reconciles network-object/switch rows referenced by restored guest
/// metadata; the restore engine never touches network tables directly.
#[async_trait]
pub trait NetworkSync: Send + Sync {
    async fn sync_standard_switches(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<()>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct MockGuestLifecycle {
        pub started: Mutex<Vec<(GuestType, u64)>>,
        pub stopped: Mutex<Vec<(GuestType, u64)>>,
        pub inactive: Mutex<std::collections::HashSet<(GuestType, u64)>>,
    }

    #[async_trait]
    impl GuestLifecycle for MockGuestLifecycle {
        async fn start(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<()> {
            self.started.lock().push((guest_type, guest_id));
            self.inactive.lock().remove(&(guest_type, guest_id));
            Ok(())
        }

        async fn stop(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<()> {
            self.stopped.lock().push((guest_type, guest_id));
            self.inactive.lock().insert((guest_type, guest_id));
            Ok(())
        }

        async fn is_inactive(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<bool> {
            Ok(self.inactive.lock().contains(&(guest_type, guest_id)))
        }
    }
}
