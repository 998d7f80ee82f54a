// src/core/backup/suffix.rs

//! `autoDestSuffix` and the snapshot-name validator shared by the backup
//! and replication pipelines.

use regex::Regex;
use std::sync::LazyLock;

static SNAPSHOT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._:/-]+@[A-Za-z0-9._:-]+$").expect("valid regex"));

pub fn is_snapshot_name(candidate: &str) -> bool {
    SNAPSHOT_NAME_RE.is_match(candidate)
}

/// Greedy suffix starting at the rightmost `jails` or `virtual-machines`
/// path segment; falls back to replacing `/` with `-` when neither segment
/// is present. Idempotent: the suffix itself still starts at that same
/// segment, so reapplying it is a no-op.
pub fn auto_dest_suffix(source: &str) -> String {
    let segments: Vec<&str> = source.split('/').collect();
    let anchor = segments
        .iter()
        .rposition(|s| *s == "jails" || *s == "virtual-machines");
    match anchor {
        Some(idx) => segments[idx..].join("/"),
        None => source.replace('/', "-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchors_on_rightmost_jails_segment() {
        assert_eq!(auto_dest_suffix("zroot/sylve/jails/105"), "jails/105");
    }

    #[test]
    fn anchors_on_rightmost_virtual_machines_segment() {
        assert_eq!(
            auto_dest_suffix("zroot/sylve/virtual-machines/7"),
            "virtual-machines/7"
        );
    }

    #[test]
    fn falls_back_to_dash_join_without_anchor_segment() {
        assert_eq!(auto_dest_suffix("zroot/data/misc"), "zroot-data-misc");
    }

    #[test]
    fn idempotent_when_reapplied_to_its_own_output() {
        let once = auto_dest_suffix("zroot/sylve/jails/105");
        let twice = auto_dest_suffix(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn snapshot_regex_accepts_standard_names() {
        assert!(is_snapshot_name("zroot/data@zelta_2026-02-18_12.00.00"));
        assert!(is_snapshot_name("tank/backups/jails/105@ha_1700000000"));
    }

    #[test]
    fn snapshot_regex_rejects_missing_at_sign() {
        assert!(!is_snapshot_name("zroot/data-zelta_20260218"));
    }
}
