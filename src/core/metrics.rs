// src/core/metrics.rs

//! Defines and registers Prometheus metrics for fleet monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Raft / cluster gauges ---
    /// 1 if this node currently believes itself to be the Raft leader, else 0.
    pub static ref IS_RAFT_LEADER: Gauge =
        register_gauge!("fleet_is_raft_leader", "Whether this node is the current Raft leader (1 for true, 0 for false).").unwrap();
    /// The number of nodes currently known to the cluster membership list.
    pub static ref CLUSTER_NODE_COUNT: Gauge =
        register_gauge!("fleet_cluster_node_count", "Number of nodes in the configured cluster membership.").unwrap();
    /// The number of nodes whose last health poll marked them offline.
    pub static ref CLUSTER_NODES_OFFLINE: Gauge =
        register_gauge!("fleet_cluster_nodes_offline", "Number of nodes currently marked offline by the health reconciler.").unwrap();

    // --- Backup counters/histograms ---
    /// Total number of backup jobs that completed successfully.
    pub static ref BACKUP_JOBS_SUCCEEDED_TOTAL: Counter =
        register_counter!("fleet_backup_jobs_succeeded_total", "Total number of backup jobs that completed successfully.").unwrap();
    /// Total number of backup jobs that failed, labeled by the classified failure reason.
    pub static ref BACKUP_JOBS_FAILED_TOTAL: CounterVec =
        register_counter_vec!("fleet_backup_jobs_failed_total", "Total number of failed backup jobs, labeled by reason.", &["reason"]).unwrap();
    /// Duration of a single backup job run, in seconds.
    pub static ref BACKUP_JOB_DURATION_SECONDS: Histogram =
        register_histogram!("fleet_backup_job_duration_seconds", "Duration of a backup job run in seconds.").unwrap();

    // --- Replication counters/histograms ---
    /// Total number of HA replication pushes that completed successfully.
    pub static ref REPLICATION_RUNS_SUCCEEDED_TOTAL: Counter =
        register_counter!("fleet_replication_runs_succeeded_total", "Total number of replication pushes that completed successfully.").unwrap();
    /// Total number of HA replication pushes that failed, labeled by target node.
    pub static ref REPLICATION_RUNS_FAILED_TOTAL: CounterVec =
        register_counter_vec!("fleet_replication_runs_failed_total", "Total number of failed replication pushes, labeled by target node uuid.", &["target"]).unwrap();
    /// Duration of a single replication push, in seconds.
    pub static ref REPLICATION_RUN_DURATION_SECONDS: Histogram =
        register_histogram!("fleet_replication_run_duration_seconds", "Duration of a replication push in seconds.").unwrap();

    // --- Failover counters ---
    /// Total number of times a guest's active ownership failed over to another node.
    pub static ref FAILOVER_EVENTS_TOTAL: Counter =
        register_counter!("fleet_failover_events_total", "Total number of guest ownership failovers performed.").unwrap();
    /// Total number of times this node self-fenced a guest due to an expired lease.
    pub static ref SELF_FENCE_EVENTS_TOTAL: Counter =
        register_counter!("fleet_self_fence_events_total", "Total number of guests self-fenced locally due to an expired lease.").unwrap();

    // --- Restore ---
    /// Total number of restore operations, labeled by outcome.
    pub static ref RESTORE_RUNS_TOTAL: CounterVec =
        register_counter_vec!("fleet_restore_runs_total", "Total number of restore operations, labeled by outcome.", &["outcome"]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
