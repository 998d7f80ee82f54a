// src/config.rs

//! Loads and validates the node's TOML configuration: its own identity and
//! listeners, the statically configured cluster membership it reconciles
//! health against, and the on-disk paths for Raft/queue/local state.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use uuid::Uuid;

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8123
}

fn default_log_level() -> String {
    "info".into()
}

fn default_metrics_port() -> u16 {
    8878
}

fn default_ssh_port() -> u16 {
    crate::core::ssh_server::DEFAULT_PORT
}

fn default_data_dir() -> String {
    "/var/db/fleetkeeper".into()
}

fn default_cert_path() -> String {
    "/usr/local/etc/fleetkeeper/tls.crt".into()
}

fn default_key_path() -> String {
    "/usr/local/etc/fleetkeeper/tls.key".into()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

/// One statically configured cluster peer. `raft_node_id` is the
/// `async-raft` `NodeId`; `uuid` is the business-level node identity used
/// throughout the replicated model. The two are deliberately distinct
/// namespaces (see [`crate::core::raft::network::PeerRegistry`]).
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub raft_node_id: u64,
    pub uuid: Uuid,
    pub api_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    node_uuid: Uuid,
    raft_node_id: u64,
    zfs_pool: String,
    cluster_key: String,
    #[serde(default)]
    peers: Vec<PeerConfig>,
    #[serde(default = "default_ssh_port")]
    ssh_port: u16,
    #[serde(default)]
    ssh_host_key_path: Option<String>,
    #[serde(default)]
    ssh_authorized_keys_path: Option<String>,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    tls: TlsConfig,
}

/// The validated, final configuration every other module builds from.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub data_dir: PathBuf,
    pub node_uuid: Uuid,
    pub raft_node_id: u64,
    pub zfs_pool: String,
    pub cluster_key: String,
    pub peers: Vec<PeerConfig>,
    pub ssh_port: u16,
    pub ssh_host_key_path: PathBuf,
    pub ssh_authorized_keys_path: PathBuf,
    pub metrics: MetricsConfig,
    pub tls: TlsConfig,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw_text = std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
        let raw: RawConfig = toml::from_str(&raw_text).with_context(|| format!("parsing config file {path}"))?;
        let data_dir = PathBuf::from(&raw.data_dir);
        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            ssh_host_key_path: raw
                .ssh_host_key_path
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("ssh_host_key")),
            ssh_authorized_keys_path: raw
                .ssh_authorized_keys_path
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/root/.ssh/authorized_keys")),
            data_dir,
            node_uuid: raw.node_uuid,
            raft_node_id: raw.raft_node_id,
            zfs_pool: raw.zfs_pool,
            cluster_key: raw.cluster_key,
            peers: raw.peers,
            ssh_port: raw.ssh_port,
            metrics: raw.metrics,
            tls: raw.tls,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.zfs_pool.trim().is_empty() {
            bail!("zfs_pool must not be empty");
        }
        if self.cluster_key.trim().is_empty() {
            bail!("cluster_key must not be empty");
        }
        for peer in &self.peers {
            if peer.raft_node_id == self.raft_node_id && peer.uuid != self.node_uuid {
                bail!("peer entry {} reuses this node's raft_node_id with a different uuid", peer.raft_node_id);
            }
        }
        if self.tls.enabled && (self.tls.cert_path.trim().is_empty() || self.tls.key_path.trim().is_empty()) {
            bail!("tls.enabled requires both cert_path and key_path");
        }
        Ok(())
    }

    pub fn raft_db_path(&self) -> PathBuf {
        self.data_dir.join("raft_log.sqlite3")
    }

    pub fn raft_snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("raft_snapshots")
    }

    pub fn local_db_path(&self) -> PathBuf {
        self.data_dir.join("local.sqlite3")
    }
}
