// src/core/model/node.rs

//! The `Node` cluster object, owned by the Raft FSM and written exclusively
//! by the health reconciler (component B).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// A peer's health snapshot, replicated through Raft.
///
/// Created on first successful poll; deleted when the peer falls out of the
/// Raft membership set (see [`crate::core::health::reconciler`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: uuid::Uuid,
    pub api_endpoint: String,
    pub hostname: String,
    pub status: NodeStatus,
    pub cpu_count: u32,
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    pub mem_pct: f64,
    pub disk_bytes: u64,
    pub disk_pct: f64,
    pub guest_ids: BTreeSet<u64>,
}

impl Node {
    /// True when any observed field crossed a threshold relative to `self`
    /// (the previously persisted row). `self` is the existing row, `cur` is
    /// the freshly polled snapshot. Gates whether the reconciler proposes a
    /// write for this poll at all.
    pub fn has_significant_change(&self, cur: &Node) -> bool {
        if self.status != cur.status {
            return true;
        }
        if self.api_endpoint != cur.api_endpoint {
            return true;
        }
        if self.hostname != cur.hostname {
            return true;
        }
        if self.guest_ids != cur.guest_ids {
            return true;
        }
        if cur.cpu_count > 0 && self.cpu_count != cur.cpu_count {
            return true;
        }
        if cur.mem_bytes > 0 && self.mem_bytes != cur.mem_bytes {
            return true;
        }
        if cur.disk_bytes > 0 && self.disk_bytes != cur.disk_bytes {
            return true;
        }
        const PCT_THRESHOLD: f64 = 5.0;
        if (self.cpu_pct - cur.cpu_pct).abs() >= PCT_THRESHOLD {
            return true;
        }
        if (self.mem_pct - cur.mem_pct).abs() >= PCT_THRESHOLD {
            return true;
        }
        if (self.disk_pct - cur.disk_pct).abs() >= PCT_THRESHOLD {
            return true;
        }
        false
    }

    /// Sum of the three usage-percentage gauges, used by the failover
    /// controller's load-ordered target selection.
    pub fn load_score(&self) -> f64 {
        self.cpu_pct + self.mem_pct + self.disk_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Node {
        Node {
            uuid: uuid::Uuid::nil(),
            api_endpoint: "https://10.0.0.1:8123".into(),
            hostname: "node-a".into(),
            status: NodeStatus::Online,
            cpu_count: 8,
            cpu_pct: 10.0,
            mem_bytes: 1 << 30,
            mem_pct: 20.0,
            disk_bytes: 1 << 40,
            disk_pct: 30.0,
            guest_ids: BTreeSet::from([101, 102]),
        }
    }

    #[test]
    fn no_change_when_nothing_crosses_threshold() {
        let old = base();
        let mut cur = base();
        cur.cpu_pct += 1.0; // below the 5-point threshold
        assert!(!old.has_significant_change(&cur));
    }

    #[test]
    fn change_on_status_flip() {
        let old = base();
        let mut cur = base();
        cur.status = NodeStatus::Offline;
        assert!(old.has_significant_change(&cur));
    }

    #[test]
    fn change_on_guest_set_difference() {
        let old = base();
        let mut cur = base();
        cur.guest_ids.insert(999);
        assert!(old.has_significant_change(&cur));
    }

    #[test]
    fn change_on_percentage_threshold_crossed() {
        let old = base();
        let mut cur = base();
        cur.cpu_pct += 5.0;
        assert!(old.has_significant_change(&cur));
    }

    #[test]
    fn zero_measured_value_does_not_trigger_count_change() {
        let old = base();
        let mut cur = base();
        cur.cpu_count = 0; // not measured this poll
        assert!(!old.has_significant_change(&cur));
    }
}
