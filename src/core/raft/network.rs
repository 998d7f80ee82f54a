// src/core/raft/network.rs

//! `RaftNetwork` impl: every RPC is a plain JSON POST to a peer's embedded
//! HTTP API. Peer addresses are looked up from the membership-derived
//! registry kept in [`PeerRegistry`], populated by the health reconciler.

use super::command::Command;
use anyhow::{anyhow, Result};
use async_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use async_raft::{NodeId, RaftNetwork};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

/// Maps a Raft `NodeId` to the peer's base API URL (`https://host:port`).
#[derive(Debug, Default, Clone)]
pub struct PeerRegistry {
    peers: std::sync::Arc<DashMap<NodeId, String>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, node_id: NodeId, base_url: String) {
        self.peers.insert(node_id, base_url);
    }

    pub fn remove(&self, node_id: NodeId) {
        self.peers.remove(&node_id);
    }

    pub fn get(&self, node_id: NodeId) -> Option<String> {
        self.peers.get(&node_id).map(|v| v.clone())
    }
}

pub struct HttpRaftNetwork {
    client: reqwest::Client,
    peers: PeerRegistry,
}

impl HttpRaftNetwork {
    pub fn new(peers: PeerRegistry) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(true)
            .build()
            .expect("building raft rpc http client");
        Self { client, peers }
    }

    fn base_url(&self, target: NodeId) -> Result<String> {
        self.peers
            .get(target)
            .ok_or_else(|| anyhow!("no known address for raft peer {target}"))
    }
}

#[async_trait]
impl RaftNetwork<Command> for HttpRaftNetwork {
    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<Command>,
    ) -> Result<AppendEntriesResponse> {
        let url = format!("{}/internal/raft/append-entries", self.base_url(target)?);
        let resp = self.client.post(url).json(&rpc).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let url = format!("{}/internal/raft/install-snapshot", self.base_url(target)?);
        let resp = self.client.post(url).json(&rpc).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let url = format!("{}/internal/raft/vote", self.base_url(target)?);
        let resp = self.client.post(url).json(&rpc).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }
}
