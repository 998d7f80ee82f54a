// src/core/failover/selffence.rs

//! Runs on every node, every tick: stops any locally running guest whose
//! replication lease is missing, owned elsewhere, or expired. Closes the
//! race where a formerly active node returns after its lease lapsed.

use crate::core::capability::GuestLifecycle;
use crate::core::raft::FleetStateMachine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub async fn run_self_fence_tick(
    sm: &FleetStateMachine,
    local_node_id: Uuid,
    guests: &impl GuestLifecycle,
    now: DateTime<Utc>,
) {
    for policy in sm.replication_policies.values() {
        if !policy.enabled {
            continue;
        }
        if guests.is_inactive(policy.guest_type, policy.guest_id).await.unwrap_or(true) {
            continue;
        }
        let lease = sm.replication_leases.get(&policy.id);
        let should_fence = match lease {
            None => true,
            Some(lease) => !lease.is_owned_by(local_node_id, now),
        };
        if should_fence {
            let _ = guests.stop(policy.guest_type, policy.guest_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capability::mock::MockGuestLifecycle;
    use crate::core::model::{FailbackMode, GuestType, ReplicationLease, ReplicationPolicy, SourceMode};
    use std::sync::Arc;

    fn policy() -> ReplicationPolicy {
        ReplicationPolicy {
            id: 1,
            name: "jail-105-ha".into(),
            guest_type: GuestType::Jail,
            guest_id: 105,
            source_mode: SourceMode::FollowActive,
            source_node_id: None,
            active_node_id: None,
            failback_mode: FailbackMode::Manual,
            cron_expr: None,
            enabled: true,
            next_run_at: None,
            last_status: None,
            last_error: None,
            targets: vec![],
        }
    }

    #[tokio::test]
    async fn fences_running_guest_with_no_lease() {
        let local = Uuid::new_v4();
        let guests = Arc::new(MockGuestLifecycle::default());
        guests.started.lock().push((GuestType::Jail, 105));

        let mut sm = FleetStateMachine::default();
        sm.replication_policies.insert(1, policy());

        run_self_fence_tick(&sm, local, guests.as_ref(), Utc::now()).await;
        assert_eq!(guests.stopped.lock().as_slice(), &[(GuestType::Jail, 105)]);
    }

    #[tokio::test]
    async fn does_not_fence_when_lease_owned_locally_and_fresh() {
        let local = Uuid::new_v4();
        let guests = Arc::new(MockGuestLifecycle::default());
        guests.started.lock().push((GuestType::Jail, 105));

        let mut sm = FleetStateMachine::default();
        sm.replication_policies.insert(1, policy());
        sm.replication_leases.insert(
            1,
            ReplicationLease {
                policy_id: 1,
                guest_type: GuestType::Jail,
                guest_id: 105,
                owner_node_id: local,
                expires_at: Utc::now() + chrono::Duration::seconds(10),
                version: 1,
                last_reason: "leader_renew".into(),
                last_actor: "leader".into(),
            },
        );

        run_self_fence_tick(&sm, local, guests.as_ref(), Utc::now()).await;
        assert!(guests.stopped.lock().is_empty());
    }

    #[tokio::test]
    async fn fences_when_lease_expired() {
        let local = Uuid::new_v4();
        let guests = Arc::new(MockGuestLifecycle::default());
        guests.started.lock().push((GuestType::Jail, 105));

        let mut sm = FleetStateMachine::default();
        sm.replication_policies.insert(1, policy());
        sm.replication_leases.insert(
            1,
            ReplicationLease {
                policy_id: 1,
                guest_type: GuestType::Jail,
                guest_id: 105,
                owner_node_id: local,
                expires_at: Utc::now() - chrono::Duration::seconds(1),
                version: 1,
                last_reason: "leader_renew".into(),
                last_actor: "leader".into(),
            },
        );

        run_self_fence_tick(&sm, local, guests.as_ref(), Utc::now()).await;
        assert_eq!(guests.stopped.lock().len(), 1);
    }
}
