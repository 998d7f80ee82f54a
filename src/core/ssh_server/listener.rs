// src/core/ssh_server/listener.rs

//! The embedded SSH server (component H): exec-only sessions authenticated
//! against the Raft-replicated `ClusterSshIdentity` registry, so a peer
//! node can push a backup/replication stream without either side needing
//! a full system `sshd` account.

use crate::core::errors::{FleetError, FleetResult};
use crate::core::model::ClusterSshIdentity;
use crate::core::raft::command::{ClusterSshIdentityAction, Command};
use crate::core::raft::router::CommandRouter;
use crate::core::raft::storage::SqliteRaftStorage;
use russh::server::{Auth, Handler, Msg, Server as _, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::{KeyPair, PublicKey};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;

pub const DEFAULT_PORT: u16 = 8122;
const IDENTITY_PUBLISH_RETRIES: u32 = 5;
const IDENTITY_PUBLISH_DELAY_MS: u64 = 250;

/// Maps a process's exit condition to the code sshd conventionally reports:
/// a clean exit passes its own code through, a signal death reports
/// 128+signal, and a never-waited child reports 1.
fn exit_code_for(status: &std::process::ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code as u32;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig as u32;
        }
    }
    1
}

pub struct ClusterSshServerConfig {
    pub bind_port: u16,
    pub host_key: KeyPair,
    pub local_node_uuid: uuid::Uuid,
    pub storage: Arc<SqliteRaftStorage>,
    pub router: Arc<CommandRouter>,
}

#[derive(Clone)]
struct SharedConfig {
    storage: Arc<SqliteRaftStorage>,
}

#[derive(Clone)]
pub struct ClusterSshServer {
    shared: SharedConfig,
}

impl ClusterSshServer {
    pub fn new(storage: Arc<SqliteRaftStorage>) -> Self {
        Self {
            shared: SharedConfig { storage },
        }
    }

    /// Binds and serves forever. Also republishes this node's own SSH
    /// identity once at startup, retrying a handful of times since the
    /// Raft leader may not be elected yet.
    pub async fn run(cfg: ClusterSshServerConfig) -> FleetResult<()> {
        publish_local_identity(&cfg).await?;

        let mut server = ClusterSshServer::new(cfg.storage);
        let russh_config = Arc::new(russh::server::Config {
            keys: vec![cfg.host_key],
            ..Default::default()
        });
        let addr = (std::net::Ipv4Addr::UNSPECIFIED, cfg.bind_port);
        server
            .run_on_address(russh_config, addr)
            .await
            .map_err(|e| FleetError::SshConnectionFailed(e.to_string()))
    }
}

async fn publish_local_identity(cfg: &ClusterSshServerConfig) -> FleetResult<()> {
    let identity = ClusterSshIdentity {
        node_uuid: cfg.local_node_uuid,
        ssh_user: "root".into(),
        ssh_host: local_advertised_host(),
        ssh_port: cfg.bind_port,
        public_key: public_key_line(&cfg.host_key),
    };

    let mut attempt = 0u32;
    loop {
        match cfg
            .router
            .apply(Command::ClusterSshIdentity(ClusterSshIdentityAction::Upsert(identity.clone())))
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if attempt + 1 >= IDENTITY_PUBLISH_RETRIES => return Err(e),
            Err(_) => {
                attempt += 1;
                tokio::time::sleep(std::time::Duration::from_millis(IDENTITY_PUBLISH_DELAY_MS * attempt as u64)).await;
            }
        }
    }
}

fn local_advertised_host() -> String {
    std::env::var("FLEETKEEPER_ADVERTISE_HOST").unwrap_or_else(|_| "0.0.0.0".into())
}

fn public_key_line(pair: &KeyPair) -> String {
    format!("{} {}", pair.name(), pair.clone_public_key().expect("host keypair has a public half").public_key_base64())
}

impl russh::server::Server for ClusterSshServer {
    type Handler = ClusterSshSession;

    fn new_client(&mut self, _peer_addr: Option<std::net::SocketAddr>) -> ClusterSshSession {
        ClusterSshSession {
            shared: self.shared.clone(),
            authenticated_as: None,
        }
    }
}

pub struct ClusterSshSession {
    shared: SharedConfig,
    authenticated_as: Option<uuid::Uuid>,
}

#[async_trait::async_trait]
impl Handler for ClusterSshSession {
    type Error = FleetError;

    async fn auth_publickey(&mut self, _user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let sm = self.shared.storage.state_machine_snapshot().await;
        let offered = public_key.public_key_base64();
        let matched = sm
            .cluster_ssh_identities
            .values()
            .find(|identity| identity.public_key.contains(&offered));

        match matched {
            Some(identity) => {
                self.authenticated_as = Some(identity.node_uuid);
                Ok(Auth::Accept)
            }
            None => Ok(Auth::Reject { proceed_with_methods: None }),
        }
    }

    async fn channel_open_session(&mut self, _channel: Channel<Msg>, session: &mut Session) -> Result<bool, Self::Error> {
        if self.authenticated_as.is_none() {
            return Ok(false);
        }
        let _ = session;
        Ok(true)
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        if self.authenticated_as.is_none() {
            session.channel_failure(channel);
            return Ok(());
        }
        let command_line = String::from_utf8_lossy(data).into_owned();

        let mut child = TokioCommand::new("/bin/sh")
            .arg("-c")
            .arg(&command_line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(FleetError::from)?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let handle = session.handle();

        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        loop {
            tokio::select! {
                n = stdout.read(&mut out_buf) => {
                    let n = n.unwrap_or(0);
                    if n == 0 { break; }
                    let _ = handle.data(channel, out_buf[..n].to_vec().into()).await;
                }
                n = stderr.read(&mut err_buf) => {
                    let n = n.unwrap_or(0);
                    if n == 0 { continue; }
                    let _ = handle.extended_data(channel, 1, err_buf[..n].to_vec().into()).await;
                }
                status = child.wait() => {
                    let status = status.map_err(FleetError::from)?;
                    let _ = handle.exit_status_request(channel, exit_code_for(&status)).await;
                    let _ = handle.eof(channel).await;
                    let _ = handle.close(channel).await;
                    return Ok(());
                }
            }
        }

        let status = child.wait().await.map_err(FleetError::from)?;
        let _ = handle.exit_status_request(channel, exit_code_for(&status)).await;
        let _ = handle.eof(channel).await;
        let _ = handle.close(channel).await;
        Ok(())
    }

    async fn data(&mut self, _channel: ChannelId, _data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::exit_code_for;
    use std::process::Command;

    #[test]
    fn clean_exit_passes_code_through() {
        let status = Command::new("/bin/sh").arg("-c").arg("exit 1").status().unwrap();
        assert_eq!(exit_code_for(&status), 1);
    }

    #[test]
    fn success_is_zero() {
        let status = Command::new("/bin/sh").arg("-c").arg("true").status().unwrap();
        assert_eq!(exit_code_for(&status), 0);
    }

    #[cfg(unix)]
    #[test]
    fn sigterm_maps_to_143() {
        let status = Command::new("/bin/sh").arg("-c").arg("kill -TERM $$").status().unwrap();
        assert_eq!(exit_code_for(&status), 143);
    }
}
