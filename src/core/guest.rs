// src/core/guest.rs

//! Production `GuestLifecycle`: jails through `jail(8)`, VMs through the
//! `vm-bhyve` `vm` command line, matching [`crate::core::dataset`]'s
//! shell-out-and-capture idiom rather than binding to either tool's
//! internals directly.

use crate::core::capability::{GuestLifecycle, GuestMetadataBuilder, NetworkSync};
use crate::core::errors::{FleetError, FleetResult};
use crate::core::model::GuestType;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

pub struct CliGuestLifecycle {
    jail_bin: String,
    vm_bin: String,
    jail_conf_dir: String,
}

impl Default for CliGuestLifecycle {
    fn default() -> Self {
        Self {
            jail_bin: "jail".into(),
            vm_bin: "vm".into(),
            jail_conf_dir: "/etc/jail.conf.d".into(),
        }
    }
}

impl CliGuestLifecycle {
    pub fn new(jail_bin: impl Into<String>, vm_bin: impl Into<String>, jail_conf_dir: impl Into<String>) -> Self {
        Self {
            jail_bin: jail_bin.into(),
            vm_bin: vm_bin.into(),
            jail_conf_dir: jail_conf_dir.into(),
        }
    }

    async fn run(&self, mut cmd: Command) -> FleetResult<bool> {
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        let output = cmd.output().await.map_err(FleetError::from)?;
        Ok(output.status.success())
    }

    fn jail_name(guest_id: u64) -> String {
        format!("fk{guest_id}")
    }

    async fn start_jail(&self, guest_id: u64) -> FleetResult<()> {
        let conf = format!("{}/{}.conf", self.jail_conf_dir, Self::jail_name(guest_id));
        let mut cmd = Command::new(&self.jail_bin);
        cmd.arg("-f").arg(&conf).arg("-c").arg(Self::jail_name(guest_id));
        self.run(cmd).await?;
        Ok(())
    }

    async fn stop_jail(&self, guest_id: u64) -> FleetResult<()> {
        let conf = format!("{}/{}.conf", self.jail_conf_dir, Self::jail_name(guest_id));
        let mut cmd = Command::new(&self.jail_bin);
        cmd.arg("-f").arg(&conf).arg("-r").arg(Self::jail_name(guest_id));
        self.run(cmd).await?;
        Ok(())
    }

    async fn jail_is_inactive(&self, guest_id: u64) -> FleetResult<bool> {
        let mut cmd = Command::new("jls");
        cmd.arg("-j").arg(Self::jail_name(guest_id)).arg("jid");
        Ok(!self.run(cmd).await?)
    }

    async fn start_vm(&self, guest_id: u64) -> FleetResult<()> {
        let mut cmd = Command::new(&self.vm_bin);
        cmd.arg("start").arg(guest_id.to_string());
        self.run(cmd).await?;
        Ok(())
    }

    async fn stop_vm(&self, guest_id: u64) -> FleetResult<()> {
        let mut cmd = Command::new(&self.vm_bin);
        cmd.arg("stop").arg(guest_id.to_string());
        self.run(cmd).await?;
        Ok(())
    }

    async fn vm_is_inactive(&self, guest_id: u64) -> FleetResult<bool> {
        let mut cmd = Command::new(&self.vm_bin);
        cmd.arg("poweroff").arg("-f").arg("--dry-run").arg(guest_id.to_string());
        Ok(!self.run(cmd).await?)
    }
}

#[async_trait]
impl GuestLifecycle for CliGuestLifecycle {
    async fn start(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<()> {
        match guest_type {
            GuestType::Jail => self.start_jail(guest_id).await,
            GuestType::Vm => self.start_vm(guest_id).await,
        }
    }

    async fn stop(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<()> {
        match guest_type {
            GuestType::Jail => self.stop_jail(guest_id).await,
            GuestType::Vm => self.stop_vm(guest_id).await,
        }
    }

    async fn is_inactive(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<bool> {
        match guest_type {
            GuestType::Jail => self.jail_is_inactive(guest_id).await,
            GuestType::Vm => self.vm_is_inactive(guest_id).await,
        }
    }
}

/// Rewrites a restored guest's own config object from the metadata the
/// restore engine reads off the dataset (`jail.json`/`vm.json`), writing the
/// jail.conf.d stub / vm-bhyve config. For VMs, each storage entry's row is
/// reconstructed with the real ZFS `guid` of its backing dataset so the
/// restored config points at what's actually on disk, not a stale value
/// carried over from the source node.
pub struct CliGuestMetadataBuilder {
    jail_conf_dir: PathBuf,
    vm_conf_dir: PathBuf,
    zfs_bin: String,
}

impl CliGuestMetadataBuilder {
    pub fn new(jail_conf_dir: impl Into<PathBuf>, vm_conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            jail_conf_dir: jail_conf_dir.into(),
            vm_conf_dir: vm_conf_dir.into(),
            zfs_bin: "zfs".into(),
        }
    }

    async fn write_stub(&self, dir: &std::path::Path, guest_id: u64, metadata: &Value) -> FleetResult<()> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("fk{guest_id}.json"));
        tokio::fs::write(&path, serde_json::to_vec_pretty(metadata)?).await?;
        Ok(())
    }

    async fn storage_guid(&self, dataset: &str) -> Option<String> {
        let output = Command::new(&self.zfs_bin)
            .args(["get", "-Hp", "-o", "value", "guid", dataset])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let guid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!guid.is_empty()).then_some(guid)
    }

    /// Attaches the real `guid` of each storage entry's backing dataset
    /// (`<pool>/sylve/virtual-machines/<rid>/<kind>-<id>`) to that entry.
    async fn reconstruct_storage_rows(&self, guest_id: u64, metadata: &mut Value) {
        let pool = metadata
            .get("dataset")
            .and_then(Value::as_str)
            .and_then(|d| d.split('/').next())
            .map(str::to_string);
        let Some(pool) = pool else { return };
        let Some(storages) = metadata.get_mut("storages").and_then(Value::as_array_mut) else {
            return;
        };
        for storage in storages.iter_mut() {
            let Some(storage_id) = storage.get("id").and_then(Value::as_u64) else {
                continue;
            };
            let kind = storage.get("kind").and_then(Value::as_str).unwrap_or("raw");
            let dataset = format!("{pool}/sylve/virtual-machines/{guest_id}/{kind}-{storage_id}");
            if let Some(guid) = self.storage_guid(&dataset).await {
                storage["guid"] = Value::String(guid);
            }
        }
    }
}

fn guest_id_from_metadata(guest_type: GuestType, metadata: &Value) -> Option<u64> {
    let id_key = match guest_type {
        GuestType::Jail => "ctid",
        GuestType::Vm => "rid",
    };
    metadata
        .get(id_key)
        .or_else(|| metadata.get("id"))
        .and_then(Value::as_u64)
        .or_else(|| {
            metadata
                .get("dataset")
                .and_then(Value::as_str)
                .and_then(|d| d.rsplit('/').next())
                .and_then(|id| id.parse::<u64>().ok())
        })
}

#[async_trait]
impl GuestMetadataBuilder for CliGuestMetadataBuilder {
    async fn create_config(&self, guest_type: GuestType, metadata: &Value) -> FleetResult<()> {
        let guest_id = guest_id_from_metadata(guest_type, metadata)
            .ok_or_else(|| FleetError::Internal("restored metadata missing a parseable guest id".into()))?;
        match guest_type {
            GuestType::Jail => self.write_stub(&self.jail_conf_dir, guest_id, metadata).await,
            GuestType::Vm => {
                let mut resolved = metadata.clone();
                self.reconstruct_storage_rows(guest_id, &mut resolved).await;
                self.write_stub(&self.vm_conf_dir, guest_id, &resolved).await
            }
        }
    }
}

/// Reconciles a restored guest's network-object references by re-running
/// the standard-switch attach command; actual switch/bridge membership
/// lives outside the cluster's replicated state entirely. Jails and VMs
/// both attach to standard switches, identified respectively by their
/// `fk<ctid>` jail name and bare `rid`.
pub struct CliNetworkSync {
    vm_bin: String,
}

impl Default for CliNetworkSync {
    fn default() -> Self {
        Self { vm_bin: "vm".into() }
    }
}

impl CliNetworkSync {
    pub fn new(vm_bin: impl Into<String>) -> Self {
        Self { vm_bin: vm_bin.into() }
    }
}

#[async_trait]
impl NetworkSync for CliNetworkSync {
    async fn sync_standard_switches(&self, guest_type: GuestType, guest_id: u64) -> FleetResult<()> {
        let ident = match guest_type {
            GuestType::Jail => CliGuestLifecycle::jail_name(guest_id),
            GuestType::Vm => guest_id.to_string(),
        };
        let mut cmd = Command::new(&self.vm_bin);
        cmd.arg("switch").arg("attach-standard").arg(ident);
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        let _ = cmd.output().await.map_err(FleetError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jail_name_is_stable_and_prefixed() {
        assert_eq!(CliGuestLifecycle::jail_name(7), "fk7");
    }
}
