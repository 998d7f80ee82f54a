// src/core/backup/classify.rs

//! Classifies the text of a completed `zelta backup`/`rotate` invocation
//! into a stable outcome, by substring match on the lowercased output.
//! Stable under concatenation with blank lines and case changes, so a
//! caller can classify partial streams without waiting for the final line.

use crate::core::errors::FleetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    UpToDate,
    BlockedNoSource,
    BlockedNoSourceSnapshot,
    BlockedNoSnapshotDiverged,
    BlockedNoCommonSnapshot,
    BlockedTargetLocalWrites,
    BlockedTargetDiverged,
    Unknown,
}

impl BackupOutcome {
    /// `None` for `UpToDate`/`Unknown` (the former a no-op success, the
    /// latter not actionable); `Some(error_code)` otherwise.
    pub fn error_code(&self) -> Option<FleetError> {
        match self {
            BackupOutcome::UpToDate | BackupOutcome::Unknown => None,
            BackupOutcome::BlockedNoSource => Some(FleetError::BackupSourceMissing),
            BackupOutcome::BlockedNoSourceSnapshot => Some(FleetError::BackupSourceSnapshotMissing),
            BackupOutcome::BlockedNoSnapshotDiverged | BackupOutcome::BlockedNoCommonSnapshot => {
                Some(FleetError::BackupTargetDiverged)
            }
            BackupOutcome::BlockedTargetLocalWrites => Some(FleetError::BackupTargetHasLocalWrites),
            BackupOutcome::BlockedTargetDiverged => Some(FleetError::BackupTargetDiverged),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BackupOutcome::UpToDate)
    }
}

pub fn classify_backup_output(output: &str) -> BackupOutcome {
    let lower = output.to_lowercase();
    if lower.contains("up-to-date") || lower.contains("up to date") {
        BackupOutcome::UpToDate
    } else if lower.contains("target has diverged") {
        BackupOutcome::BlockedTargetDiverged
    } else if lower.contains("no common snapshot") {
        BackupOutcome::BlockedNoCommonSnapshot
    } else if lower.contains("no snapshot") && lower.contains("diverged") {
        BackupOutcome::BlockedNoSnapshotDiverged
    } else if lower.contains("has been modified") || lower.contains("local writes") {
        BackupOutcome::BlockedTargetLocalWrites
    } else if lower.contains("no such dataset") && lower.contains("source") {
        BackupOutcome::BlockedNoSource
    } else if lower.contains("no snapshots") || lower.contains("no such snapshot") {
        BackupOutcome::BlockedNoSourceSnapshot
    } else {
        BackupOutcome::Unknown
    }
}

pub fn rotate_indicates_not_a_replica(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("not a replica") || lower.contains("no common snapshot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_up_to_date_regardless_of_case() {
        assert_eq!(
            classify_backup_output("Target is UP-TO-DATE\n"),
            BackupOutcome::UpToDate
        );
    }

    #[test]
    fn stable_under_concatenation_with_blank_lines() {
        let a = classify_backup_output("\n\nup-to-date\n\n");
        let b = classify_backup_output("up-to-date");
        assert_eq!(a, b);
    }

    #[test]
    fn classifies_target_diverged() {
        assert_eq!(
            classify_backup_output("error: target has diverged from source"),
            BackupOutcome::BlockedTargetDiverged
        );
    }

    #[test]
    fn classifies_unknown_for_unrecognised_text() {
        assert_eq!(
            classify_backup_output("some unrelated log line"),
            BackupOutcome::Unknown
        );
    }

    #[test]
    fn detects_not_a_replica_for_rotate_retry_gate() {
        assert!(rotate_indicates_not_a_replica("dest: not a replica of source"));
        assert!(!rotate_indicates_not_a_replica("rotate ok"));
    }
}
