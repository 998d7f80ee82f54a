// src/core/ssh_exec.rs

//! Builds the `ssh` invocations every remote dataset operation tunnels
//! through: `ssh -n -o BatchMode=yes -o StrictHostKeyChecking=accept-new
//! [-p port] [-i key] <user@host> <argv…>`.

use crate::core::dataset::SshEndpoint;
use tokio::process::Command;

pub fn build_ssh_command(endpoint: &SshEndpoint, argv: &[String]) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-n")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg("StrictHostKeyChecking=accept-new");
    if endpoint.port != 22 {
        cmd.arg("-p").arg(endpoint.port.to_string());
    }
    if let Some(key_path) = &endpoint.key_path {
        cmd.arg("-i").arg(key_path);
    }
    cmd.arg(endpoint.host_spec());
    cmd.args(argv);
    cmd
}

/// Applies the same SSH options as env vars consumed by `zelta` itself,
/// which shells to `ssh` internally rather than taking an argv prefix.
pub fn apply_ssh_env(cmd: &mut Command, endpoint: &SshEndpoint) {
    let mut opts = vec![
        "-o BatchMode=yes".to_string(),
        "-o StrictHostKeyChecking=accept-new".to_string(),
    ];
    if endpoint.port != 22 {
        opts.push(format!("-p {}", endpoint.port));
    }
    if let Some(key_path) = &endpoint.key_path {
        opts.push(format!("-i {key_path}"));
    }
    cmd.env("ZELTA_SSH_OPTS", opts.join(" "));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_port_flag_only_when_non_default() {
        let endpoint = SshEndpoint {
            user: "root".into(),
            host: "10.0.0.2".into(),
            port: 2222,
            key_path: None,
        };
        let cmd = build_ssh_command(&endpoint, &["zfs".into(), "list".into()]);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"2222".to_string()));
    }

    #[test]
    fn omits_port_flag_for_default_port() {
        let endpoint = SshEndpoint {
            user: "root".into(),
            host: "10.0.0.2".into(),
            port: 22,
            key_path: None,
        };
        let cmd = build_ssh_command(&endpoint, &["zfs".into(), "list".into()]);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(!args.contains(&"-p".to_string()));
    }
}
