// src/core/dataset.rs

//! The `Dataset` capability trait: the single seam between the backup,
//! restore, and replication engines and actual ZFS execution. Nothing above
//! this boundary shells out to `zfs`/`zelta` directly.

use crate::core::errors::{FleetError, FleetResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct SshEndpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key_path: Option<String>,
}

impl SshEndpoint {
    pub fn host_spec(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub snapshot_name_prefix: Option<String>,
    pub recv_top_override: bool,
}

#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub keep_snap_num: u32,
    pub keep_snap_days: u32,
    pub swap_args: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub dataset: String,
    pub short_name: String,
    pub created_at: DateTime<Utc>,
}

/// The stdout+stderr of one shelled-out command, interleaved in arrival
/// order, plus the line-by-line text the backup executor streams into a
/// `BackupEvent`.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub lines: Vec<String>,
    pub exit_success: bool,
}

impl CommandOutcome {
    pub fn combined(&self) -> String {
        self.lines.join("\n")
    }

    pub fn lowercased(&self) -> String {
        self.combined().to_lowercase()
    }
}

#[async_trait]
pub trait Dataset: Send + Sync {
    async fn send(
        &self,
        source: &str,
        dest: &SshEndpoint,
        dest_path: &str,
        opts: &SendOptions,
    ) -> FleetResult<CommandOutcome>;

    /// The restore-direction counterpart of `send`: pulls `remote@snapshot`
    /// from `source` into `local_dest`, the mirror image of a push.
    async fn pull(
        &self,
        remote_dataset: &str,
        snapshot: &str,
        source: &SshEndpoint,
        local_dest: &str,
    ) -> FleetResult<CommandOutcome>;

    async fn rotate(
        &self,
        source: &str,
        dest: &SshEndpoint,
        dest_path: &str,
        prefix: Option<&str>,
    ) -> FleetResult<CommandOutcome>;

    async fn prune(
        &self,
        source: &str,
        dest: &SshEndpoint,
        dest_path: &str,
        opts: &PruneOptions,
    ) -> FleetResult<CommandOutcome>;

    async fn destroy(&self, dataset_or_snapshot: &str, remote: Option<&SshEndpoint>) -> FleetResult<()>;

    async fn list_snapshots(
        &self,
        dataset: &str,
        remote: Option<&SshEndpoint>,
    ) -> FleetResult<Vec<SnapshotInfo>>;

    async fn rename(&self, from: &str, to: &str, remote: Option<&SshEndpoint>) -> FleetResult<()>;

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> FleetResult<()>;

    async fn mount(&self, dataset: &str) -> FleetResult<()>;

    /// Lists the direct child datasets of `parent` present on this node,
    /// e.g. `{pool}/sylve/virtual-machines/*`. Used by VM-mode source
    /// selection, which has no single `source_dataset` to read and instead
    /// must discover what's actually on disk.
    async fn list_local_datasets(&self, parent: &str) -> FleetResult<Vec<String>>;

    /// The local mountpoint of `dataset`, used by the restore engine to find
    /// the guest metadata (`jail.json`/`vm.json`) carried alongside it.
    async fn mountpoint(&self, dataset: &str) -> FleetResult<String>;
}

/// Production implementation: shells to the `zelta` and `zfs` binaries,
/// tunnelling remote operations through the standard SSH command template
/// (see [`crate::core::ssh_exec`]).
pub struct CliZeltaDataset {
    zelta_bin: String,
    zfs_bin: String,
}

impl Default for CliZeltaDataset {
    fn default() -> Self {
        Self {
            zelta_bin: "zelta".into(),
            zfs_bin: "zfs".into(),
        }
    }
}

impl CliZeltaDataset {
    pub fn new(zelta_bin: impl Into<String>, zfs_bin: impl Into<String>) -> Self {
        Self {
            zelta_bin: zelta_bin.into(),
            zfs_bin: zfs_bin.into(),
        }
    }

    async fn run(&self, mut cmd: Command) -> FleetResult<CommandOutcome> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(FleetError::from)?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let mut lines = Vec::new();
        let mut out_lines = BufReader::new(stdout).lines();
        while let Some(line) = out_lines.next_line().await.map_err(FleetError::from)? {
            lines.push(line);
        }
        let mut err_lines = BufReader::new(stderr).lines();
        while let Some(line) = err_lines.next_line().await.map_err(FleetError::from)? {
            lines.push(line);
        }

        let status = child.wait().await.map_err(FleetError::from)?;
        Ok(CommandOutcome {
            lines,
            exit_success: status.success(),
        })
    }
}

#[async_trait]
impl Dataset for CliZeltaDataset {
    async fn send(
        &self,
        source: &str,
        dest: &SshEndpoint,
        dest_path: &str,
        opts: &SendOptions,
    ) -> FleetResult<CommandOutcome> {
        let mut cmd = Command::new(&self.zelta_bin);
        cmd.arg("backup").arg("--json");
        if let Some(prefix) = &opts.snapshot_name_prefix {
            cmd.arg("--snap-name").arg(prefix);
        }
        cmd.arg(source)
            .arg(format!("{}:{}", dest.host_spec(), dest_path));
        crate::core::ssh_exec::apply_ssh_env(&mut cmd, dest);
        if opts.recv_top_override {
            cmd.env("ZELTA_RECV_TOP", "no");
        }
        self.run(cmd).await
    }

    async fn pull(
        &self,
        remote_dataset: &str,
        snapshot: &str,
        source: &SshEndpoint,
        local_dest: &str,
    ) -> FleetResult<CommandOutcome> {
        let mut cmd = Command::new(&self.zelta_bin);
        cmd.arg("backup")
            .arg("--json")
            .arg(format!("{}:{remote_dataset}@{snapshot}", source.host_spec()))
            .arg(local_dest)
            .env("ZELTA_RECV_TOP", "no");
        crate::core::ssh_exec::apply_ssh_env(&mut cmd, source);
        self.run(cmd).await
    }

    async fn rotate(
        &self,
        source: &str,
        dest: &SshEndpoint,
        dest_path: &str,
        prefix: Option<&str>,
    ) -> FleetResult<CommandOutcome> {
        let mut cmd = Command::new(&self.zelta_bin);
        cmd.arg("rotate");
        if let Some(prefix) = prefix {
            cmd.arg("--prefix").arg(prefix);
        }
        cmd.arg(source)
            .arg(format!("{}:{}", dest.host_spec(), dest_path));
        crate::core::ssh_exec::apply_ssh_env(&mut cmd, dest);
        self.run(cmd).await
    }

    async fn prune(
        &self,
        source: &str,
        dest: &SshEndpoint,
        dest_path: &str,
        opts: &PruneOptions,
    ) -> FleetResult<CommandOutcome> {
        let mut cmd = Command::new(&self.zelta_bin);
        cmd.arg("prune")
            .arg("--no-ranges")
            .arg(format!("--keep-snap-num={}", opts.keep_snap_num))
            .arg(format!("--keep-snap-days={}", opts.keep_snap_days));
        let dest_spec = format!("{}:{}", dest.host_spec(), dest_path);
        if opts.swap_args {
            cmd.arg(&dest_spec).arg(source);
        } else {
            cmd.arg(source).arg(&dest_spec);
        }
        crate::core::ssh_exec::apply_ssh_env(&mut cmd, dest);
        self.run(cmd).await
    }

    async fn destroy(&self, dataset_or_snapshot: &str, remote: Option<&SshEndpoint>) -> FleetResult<()> {
        match remote {
            Some(endpoint) => {
                let argv = vec![self.zfs_bin.clone(), "destroy".into(), dataset_or_snapshot.into()];
                let cmd = crate::core::ssh_exec::build_ssh_command(endpoint, &argv);
                self.run_checked(cmd).await?;
            }
            None => {
                let mut cmd = Command::new(&self.zfs_bin);
                cmd.arg("destroy").arg(dataset_or_snapshot);
                self.run_checked(cmd).await?;
            }
        }
        Ok(())
    }

    async fn list_snapshots(
        &self,
        dataset: &str,
        remote: Option<&SshEndpoint>,
    ) -> FleetResult<Vec<SnapshotInfo>> {
        let argv = vec![
            self.zfs_bin.clone(),
            "list".into(),
            "-H".into(),
            "-t".into(),
            "snapshot".into(),
            "-o".into(),
            "name,creation".into(),
            "-r".into(),
            dataset.into(),
        ];
        let outcome = match remote {
            Some(endpoint) => {
                let cmd = crate::core::ssh_exec::build_ssh_command(endpoint, &argv);
                self.run(cmd).await?
            }
            None => {
                let mut cmd = Command::new(&self.zfs_bin);
                cmd.args(&argv[1..]);
                self.run(cmd).await?
            }
        };

        let mut out = Vec::new();
        for line in &outcome.lines {
            let mut parts = line.splitn(2, '\t');
            let Some(name) = parts.next() else { continue };
            let Some(created_raw) = parts.next() else { continue };
            let Some((ds, short_name)) = name.split_once('@') else {
                continue;
            };
            let created_at = chrono::DateTime::parse_from_str(created_raw.trim(), "%a %b %e %T %Y")
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            out.push(SnapshotInfo {
                dataset: ds.to_string(),
                short_name: short_name.to_string(),
                created_at,
            });
        }
        Ok(out)
    }

    async fn rename(&self, from: &str, to: &str, remote: Option<&SshEndpoint>) -> FleetResult<()> {
        let argv = vec![self.zfs_bin.clone(), "rename".into(), from.into(), to.into()];
        match remote {
            Some(endpoint) => {
                let cmd = crate::core::ssh_exec::build_ssh_command(endpoint, &argv);
                self.run_checked(cmd).await?;
            }
            None => {
                let mut cmd = Command::new(&self.zfs_bin);
                cmd.arg("rename").arg(from).arg(to);
                self.run_checked(cmd).await?;
            }
        }
        Ok(())
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> FleetResult<()> {
        let mut cmd = Command::new(&self.zfs_bin);
        cmd.arg("set").arg(format!("{key}={value}")).arg(dataset);
        self.run_checked(cmd).await?;
        Ok(())
    }

    async fn mount(&self, dataset: &str) -> FleetResult<()> {
        let mut cmd = Command::new(&self.zfs_bin);
        cmd.arg("mount").arg(dataset);
        let outcome = self.run(cmd).await?;
        if !outcome.exit_success && !outcome.lowercased().contains("already mounted") {
            return Err(FleetError::Internal(format!(
                "zfs mount {dataset} failed: {}",
                outcome.combined()
            )));
        }
        Ok(())
    }

    async fn list_local_datasets(&self, parent: &str) -> FleetResult<Vec<String>> {
        let mut cmd = Command::new(&self.zfs_bin);
        cmd.args(["list", "-H", "-o", "name", "-r", parent]);
        let outcome = self.run(cmd).await?;
        Ok(outcome
            .lines
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty() && l.as_str() != parent)
            .collect())
    }

    async fn mountpoint(&self, dataset: &str) -> FleetResult<String> {
        let mut cmd = Command::new(&self.zfs_bin);
        cmd.args(["list", "-H", "-o", "mountpoint", dataset]);
        let outcome = self.run_checked(cmd).await?;
        let mountpoint = outcome.lines.first().map(|l| l.trim().to_string()).unwrap_or_default();
        if mountpoint.is_empty() || mountpoint == "-" || mountpoint == "none" {
            return Err(FleetError::Internal(format!("dataset {dataset} has no mountpoint")));
        }
        Ok(mountpoint)
    }
}

impl CliZeltaDataset {
    async fn run_checked(&self, cmd: Command) -> FleetResult<CommandOutcome> {
        let outcome = self.run(cmd).await?;
        if !outcome.exit_success {
            return Err(FleetError::Internal(format!(
                "command failed: {}",
                outcome.combined()
            )));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Test double driving the unit/integration suite: records every call
    /// and returns canned outcomes keyed by a caller-chosen scenario label.
    #[derive(Default)]
    pub struct MockDataset {
        pub send_outcomes: Mutex<Vec<CommandOutcome>>,
        pub pull_outcomes: Mutex<Vec<CommandOutcome>>,
        pub rotate_outcomes: Mutex<Vec<CommandOutcome>>,
        pub prune_outcomes: Mutex<Vec<CommandOutcome>>,
        pub snapshots: Mutex<HashMap<String, Vec<SnapshotInfo>>>,
        pub renamed: Mutex<Vec<(String, String)>>,
        pub destroyed: Mutex<Vec<String>>,
        pub properties: Mutex<Vec<(String, String, String)>>,
        pub mounted: Mutex<Vec<String>>,
        pub local_datasets: Mutex<HashMap<String, Vec<String>>>,
        pub mountpoints: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl Dataset for MockDataset {
        async fn send(
            &self,
            _source: &str,
            _dest: &SshEndpoint,
            _dest_path: &str,
            _opts: &SendOptions,
        ) -> FleetResult<CommandOutcome> {
            let mut q = self.send_outcomes.lock();
            Ok(if q.is_empty() {
                CommandOutcome {
                    lines: vec!["up-to-date".into()],
                    exit_success: true,
                }
            } else {
                q.remove(0)
            })
        }

        async fn pull(
            &self,
            _remote_dataset: &str,
            _snapshot: &str,
            _source: &SshEndpoint,
            _local_dest: &str,
        ) -> FleetResult<CommandOutcome> {
            let mut q = self.pull_outcomes.lock();
            Ok(if q.is_empty() {
                CommandOutcome {
                    lines: vec!["received".into()],
                    exit_success: true,
                }
            } else {
                q.remove(0)
            })
        }

        async fn rotate(
            &self,
            _source: &str,
            _dest: &SshEndpoint,
            _dest_path: &str,
            _prefix: Option<&str>,
        ) -> FleetResult<CommandOutcome> {
            let mut q = self.rotate_outcomes.lock();
            Ok(if q.is_empty() {
                CommandOutcome {
                    lines: vec!["rotated".into()],
                    exit_success: true,
                }
            } else {
                q.remove(0)
            })
        }

        async fn prune(
            &self,
            _source: &str,
            _dest: &SshEndpoint,
            _dest_path: &str,
            _opts: &PruneOptions,
        ) -> FleetResult<CommandOutcome> {
            let mut q = self.prune_outcomes.lock();
            Ok(if q.is_empty() {
                CommandOutcome::default()
            } else {
                q.remove(0)
            })
        }

        async fn destroy(&self, dataset_or_snapshot: &str, _remote: Option<&SshEndpoint>) -> FleetResult<()> {
            self.destroyed.lock().push(dataset_or_snapshot.to_string());
            Ok(())
        }

        async fn list_snapshots(
            &self,
            dataset: &str,
            _remote: Option<&SshEndpoint>,
        ) -> FleetResult<Vec<SnapshotInfo>> {
            Ok(self.snapshots.lock().get(dataset).cloned().unwrap_or_default())
        }

        async fn rename(&self, from: &str, to: &str, _remote: Option<&SshEndpoint>) -> FleetResult<()> {
            self.renamed.lock().push((from.to_string(), to.to_string()));
            Ok(())
        }

        async fn set_property(&self, dataset: &str, key: &str, value: &str) -> FleetResult<()> {
            self.properties
                .lock()
                .push((dataset.to_string(), key.to_string(), value.to_string()));
            Ok(())
        }

        async fn mount(&self, dataset: &str) -> FleetResult<()> {
            self.mounted.lock().push(dataset.to_string());
            Ok(())
        }

        async fn list_local_datasets(&self, parent: &str) -> FleetResult<Vec<String>> {
            Ok(self.local_datasets.lock().get(parent).cloned().unwrap_or_default())
        }

        async fn mountpoint(&self, dataset: &str) -> FleetResult<String> {
            self.mountpoints
                .lock()
                .get(dataset)
                .cloned()
                .ok_or_else(|| FleetError::Internal(format!("no mountpoint configured for {dataset}")))
        }
    }
}
