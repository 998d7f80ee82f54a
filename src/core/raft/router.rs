// src/core/raft/router.rs

//! Write-path entry point used by every caller that wants to mutate
//! replicated state: the HTTP handlers, the backup/replication/failover
//! engines, the health reconciler. Discovers the current leader and either
//! submits locally (if we are the leader) or forwards over HTTP.

use super::command::{Command, CommandResponse};
use super::network::PeerRegistry;
use crate::core::errors::{FleetError, FleetResult};
use async_raft::raft::ClientWriteRequest;
use async_raft::{NodeId, Raft};
use std::sync::Arc;
use std::time::Duration;

use super::storage::SqliteRaftStorage;
use super::network::HttpRaftNetwork;

pub type FleetRaft = Raft<Command, CommandResponse, HttpRaftNetwork, SqliteRaftStorage>;

/// The timeout an `Apply` call is allowed before the caller treats it as
/// failed and surfaces `raft_apply_failed`: the request may still commit
/// after this, but the caller can no longer wait on it.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `apply` will wait for a leader to become known/reachable before
/// giving up, and the interval between re-checks. Leader election on
/// startup or right after a failover can take a few seconds; callers
/// shouldn't see `leader_unknown` for a transient gap that short.
const LEADER_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(250);

enum Leader {
    Local,
    Remote(String),
}

#[derive(Clone)]
pub struct CommandRouter {
    node_id: NodeId,
    raft: Arc<FleetRaft>,
    peers: PeerRegistry,
    http: reqwest::Client,
}

impl CommandRouter {
    pub fn new(node_id: NodeId, raft: Arc<FleetRaft>, peers: PeerRegistry) -> Self {
        let http = reqwest::Client::builder()
            .timeout(APPLY_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("building raft client-write http client");
        Self {
            node_id,
            raft,
            peers,
            http,
        }
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.raft.current_leader().await
    }

    pub fn is_local_leader(&self, leader: Option<NodeId>) -> bool {
        leader == Some(self.node_id)
    }

    /// Proposes `cmd`. If this node is the leader, submits directly to
    /// Raft; otherwise forwards the command as a JSON POST to the leader's
    /// `/internal/raft/client-write` endpoint. Either path is bounded by
    /// [`APPLY_TIMEOUT`].
    pub async fn apply(&self, cmd: Command) -> FleetResult<CommandResponse> {
        let leader = self.current_leader().await;
        if self.is_local_leader(leader) {
            return self.apply_local(cmd).await;
        }

        match self.await_reachable_leader().await? {
            Leader::Local => self.apply_local(cmd).await,
            Leader::Remote(base_url) => {
                let url = format!("{base_url}/internal/raft/client-write");
                let send = self.http.post(url).json(&cmd).send();
                match tokio::time::timeout(APPLY_TIMEOUT, send).await {
                    Ok(Ok(resp)) => match resp.error_for_status() {
                        Ok(resp) => resp
                            .json::<CommandResponse>()
                            .await
                            .map_err(|e| FleetError::HttpClientError(e.to_string())),
                        Err(e) => Err(FleetError::HttpClientError(e.to_string())),
                    },
                    Ok(Err(e)) => Err(FleetError::HttpClientError(e.to_string())),
                    Err(_) => Err(FleetError::RaftApplyFailed),
                }
            }
        }
    }

    /// Re-checks leadership every [`LEADER_POLL_INTERVAL`] for up to
    /// [`LEADER_POLL_TIMEOUT`] before giving up. A just-elected or
    /// just-failed-over leader can take a moment to show up in both
    /// `current_leader()` and the peer registry; callers shouldn't see
    /// `leader_unknown` for a gap that short.
    async fn await_reachable_leader(&self) -> FleetResult<Leader> {
        let deadline = tokio::time::Instant::now() + LEADER_POLL_TIMEOUT;
        loop {
            let leader = self.current_leader().await;
            if self.is_local_leader(leader) {
                return Ok(Leader::Local);
            }
            if let Some(leader_id) = leader {
                if let Some(base_url) = self.peers.get(leader_id) {
                    return Ok(Leader::Remote(base_url));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FleetError::LeaderUnknown);
            }
            tokio::time::sleep(LEADER_POLL_INTERVAL).await;
        }
    }

    async fn apply_local(&self, cmd: Command) -> FleetResult<CommandResponse> {
        let request = ClientWriteRequest::new(cmd);
        let fut = self.raft.client_write(request);
        match tokio::time::timeout(APPLY_TIMEOUT, fut).await {
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(e)) => Err(FleetError::FsmApplyFailed(e.to_string())),
            Err(_) => Err(FleetError::RaftApplyFailed),
        }
    }
}
