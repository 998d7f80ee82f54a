// src/core/model/misc.rs

//! Thin, Raft-replicated objects auxiliary to the three core subsystems.
//! These carry unrelated cluster-wide settings (notes, S3 targets, watched
//! directories) through the same replicated log so every node's local store
//! stays eventually consistent with the leader's, even though no backup,
//! replication, or health code reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub path_style: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub id: i64,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    pub enabled: bool,
}
