// src/core/backup/lineage.rs

//! Dataset lineage: a family of sibling datasets sharing a base name,
//! distinguished by rotation/preservation suffixes rather than matched on
//! ad hoc strings at every call site.

use crate::core::dataset::SnapshotInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageKind {
    Active,
    Rotated,
    Preserved,
    Other,
}

/// Classifies a sibling dataset name relative to its `base` name, per the
/// rule set: `.pre_sylve_*` → preserved; `_zelta_*` → rotated; a leaf
/// containing `.pre_` → other; else active.
pub fn classify(base: &str, candidate: &str) -> LineageKind {
    if candidate == base {
        return LineageKind::Active;
    }
    let leaf = candidate.rsplit('/').next().unwrap_or(candidate);
    if leaf.contains(".pre_sylve_") {
        LineageKind::Preserved
    } else if leaf.contains("_zelta_") {
        LineageKind::Rotated
    } else if leaf.contains(".pre_") {
        LineageKind::Other
    } else {
        LineageKind::Active
    }
}

/// Walks sibling datasets at the same depth as `base` whose names match
/// `{base}_zelta_*` or `{base}.pre_sylve_*`, oldest to newest, and returns
/// the latest one that actually contains `snapshot_short_name`. `siblings`
/// is the full listing of datasets at that depth (as the caller already has
/// it from a `zfs list`); this function only classifies and filters.
pub fn resolve_snapshot_owner<'a>(
    base: &str,
    snapshot_short_name: &str,
    siblings: &'a [(String, Vec<SnapshotInfo>)],
) -> Option<&'a str> {
    if let Some((dataset, snaps)) = siblings.iter().find(|(d, _)| d == base) {
        if snaps.iter().any(|s| s.short_name == snapshot_short_name) {
            return Some(dataset.as_str());
        }
    }

    let mut candidates: Vec<&(String, Vec<SnapshotInfo>)> = siblings
        .iter()
        .filter(|(d, _)| {
            matches!(
                classify(base, d),
                LineageKind::Rotated | LineageKind::Preserved
            )
        })
        .filter(|(_, snaps)| snaps.iter().any(|s| s.short_name == snapshot_short_name))
        .collect();

    candidates.sort_by_key(|(_, snaps)| {
        snaps
            .iter()
            .map(|s| s.created_at)
            .max()
            .unwrap_or_default()
    });

    candidates.last().map(|(d, _)| d.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn snap(name: &str, ts: i64) -> SnapshotInfo {
        SnapshotInfo {
            dataset: "irrelevant".into(),
            short_name: name.into(),
            created_at: Utc.timestamp_opt(ts, 0).unwrap(),
        }
    }

    #[test]
    fn classifies_preserved_and_rotated_suffixes() {
        let base = "zroot/bk/jails/105";
        assert_eq!(classify(base, base), LineageKind::Active);
        assert_eq!(
            classify(base, "zroot/bk/jails/105_zelta_20260301"),
            LineageKind::Rotated
        );
        assert_eq!(
            classify(base, "zroot/bk/jails/105.pre_sylve_1700000000"),
            LineageKind::Preserved
        );
    }

    #[test]
    fn resolves_snapshot_from_rotated_sibling_when_missing_on_active() {
        let base = "zroot/bk/jails/105".to_string();
        let rotated = "zroot/bk/jails/105_zelta_20260301".to_string();
        let siblings = vec![
            (base.clone(), vec![snap("zelta_2026-03-02", 100)]),
            (rotated.clone(), vec![snap("zelta_2026-02-18_12.00.00", 50)]),
        ];
        let resolved = resolve_snapshot_owner(&base, "zelta_2026-02-18_12.00.00", &siblings);
        assert_eq!(resolved, Some(rotated.as_str()));
    }

    #[test]
    fn returns_none_when_snapshot_is_nowhere_in_the_lineage() {
        let base = "zroot/bk/jails/105".to_string();
        let siblings = vec![(base.clone(), vec![snap("zelta_2026-03-02", 100)])];
        assert_eq!(resolve_snapshot_owner(&base, "zelta_missing", &siblings), None);
    }
}
