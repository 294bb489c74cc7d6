//! What the coordinator does after a session that went wrong.

use super::error::SyncError;
use super::sync::SessionReport;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing to do.
    None,
    /// Transient; wait for the next trigger.
    Defer,
    /// Forget the applied version and start the next session from an empty
    /// cache.
    WipeAndResync,
}

/// Failure streak after `report`: sessions that finished a download pass with
/// failures extend it, sessions that got through without failures reset it,
/// sessions that never reached the server leave it alone.
pub fn next_streak(report: &SessionReport, streak: u32) -> u32 {
    if !report.failed.is_empty() {
        streak.saturating_add(1)
    } else if report.modified_on.is_some() {
        0
    } else {
        streak
    }
}

/// Decide recovery for a finished session. `streak` already includes the
/// session (see [`next_streak`]); a `threshold` of 0 disables the
/// streak rule.
pub fn decide(report: &SessionReport, streak: u32, threshold: u32) -> RecoveryAction {
    match &report.error {
        Some(SyncError::QuotaExceeded { .. }) => RecoveryAction::WipeAndResync,
        _ if threshold > 0 && streak >= threshold => RecoveryAction::WipeAndResync,
        Some(SyncError::NetworkUnavailable(_) | SyncError::ArchiveFailed(_)) => {
            RecoveryAction::Defer
        }
        _ => RecoveryAction::None,
    }
}
