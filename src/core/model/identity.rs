// src/core/model/identity.rs

use serde::{Deserialize, Serialize};

/// A node's embedded-SSH-server identity, reconciled into
/// `/root/.ssh/authorized_keys` by every other node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSshIdentity {
    pub node_uuid: uuid::Uuid,
    pub ssh_user: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub public_key: String,
}
