// src/core/ssh_server/authorized_keys.rs

//! Keeps the real `~/.ssh/authorized_keys` file in sync with the cluster's
//! registered peer public keys, inside a sentinel-delimited block so the
//! reconciliation never touches lines a human added by hand.

use crate::core::errors::FleetResult;
use crate::core::model::ClusterSshIdentity;
use std::io::Write;
use std::path::Path;

const BLOCK_START: &str = "# --- sylve cluster replication keys start ---";
const BLOCK_END: &str = "# --- sylve cluster replication keys end ---";

/// Rewrites the sentinel block in `path` to contain exactly the public
/// keys in `identities`, preserving everything outside the block verbatim.
/// Creates the file (and its block) if it doesn't exist yet.
pub fn reconcile(path: &Path, identities: &[ClusterSshIdentity]) -> FleetResult<()> {
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let mut out = String::with_capacity(existing.len() + identities.len() * 128);

    let before = existing.split(BLOCK_START).next().unwrap_or("");
    out.push_str(before.trim_end());
    if !out.is_empty() {
        out.push('\n');
    }

    out.push_str(BLOCK_START);
    out.push('\n');
    for identity in identities {
        out.push_str(&format!(
            "{} sylve-cluster-{}\n",
            identity.public_key.trim(),
            identity.node_uuid
        ));
    }
    out.push_str(BLOCK_END);
    out.push('\n');

    if let Some((_, after)) = existing.split_once(BLOCK_END) {
        let after = after.trim_start_matches('\n');
        if !after.is_empty() {
            out.push_str(after);
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(out.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn identity(key: &str) -> ClusterSshIdentity {
        ClusterSshIdentity {
            node_uuid: Uuid::new_v4(),
            ssh_user: "root".into(),
            ssh_host: "10.0.0.2".into(),
            ssh_port: 8122,
            public_key: key.into(),
        }
    }

    #[test]
    fn preserves_hand_written_lines_outside_the_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, "ssh-ed25519 AAAAhuman human@laptop\n").unwrap();

        reconcile(&path, &[identity("ssh-ed25519 AAAAcluster")]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("ssh-ed25519 AAAAhuman human@laptop"));
        assert!(contents.contains("ssh-ed25519 AAAAcluster"));
    }

    #[test]
    fn repeated_reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let identities = vec![identity("ssh-ed25519 AAAAone")];

        reconcile(&path, &identities).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        reconcile(&path, &identities).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn dropped_identity_is_removed_from_the_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let a = identity("ssh-ed25519 AAAAone");
        let b = identity("ssh-ed25519 AAAAtwo");

        reconcile(&path, &[a.clone(), b]).unwrap();
        reconcile(&path, &[a]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("AAAAone"));
        assert!(!contents.contains("AAAAtwo"));
    }
}
