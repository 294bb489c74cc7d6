//! Records stored in the sync ledger.

use chrono::{DateTime, Utc};

use crate::media::{AssetState, MediaAsset};
use crate::types::MediaKind;

/// Ledger row for one manifest asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub filename: String,
    /// Lowercase hex MD5 declared by the manifest.
    pub checksum: String,
    pub kind: MediaKind,
    /// Last known classification.
    pub state: AssetState,
    pub size_bytes: Option<u64>,
    /// When the file was last found or made valid.
    pub verified_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub download_attempts: u32,
    pub last_error: Option<String>,
}

impl AssetRecord {
    pub fn from_asset(asset: &MediaAsset) -> Self {
        Self {
            filename: asset.filename.clone(),
            checksum: asset.expected_checksum.clone(),
            kind: asset.kind,
            state: asset.state(),
            size_bytes: None,
            verified_at: None,
            last_seen_at: Utc::now(),
            download_attempts: 0,
            last_error: None,
        }
    }
}

/// What started a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Poll,
    FullRefresh,
    Manual,
    Resync,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::FullRefresh => "full_refresh",
            Self::Manual => "manual",
            Self::Resync => "resync",
        }
    }
}

/// Statistics written when a sync run completes.
#[derive(Debug, Clone, Default)]
pub struct SyncRunStats {
    pub modified_on: Option<i64>,
    pub assets_seen: u64,
    pub assets_downloaded: u64,
    pub assets_failed: u64,
    /// Generation published by this run, if any.
    pub bundle_generation: Option<String>,
    /// Short outcome label: `synced`, `unchanged`, `deferred`, `failed`, ...
    pub outcome: String,
}

/// Summary for `status`.
#[derive(Debug, Clone)]
pub struct LedgerSummary {
    pub total_assets: u64,
    pub valid: u64,
    pub failed: u64,
    pub applied_version: Option<i64>,
    pub failure_streak: u32,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
}

impl LedgerSummary {
    /// Assets neither valid nor failed.
    pub fn other(&self) -> u64 {
        self.total_assets.saturating_sub(self.valid + self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::AssetRef;
    use crate::media::MediaStore;

    #[test]
    fn record_from_asset_copies_identity_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path()).unwrap();
        let mut asset = MediaAsset::new(
            &AssetRef {
                filename: "clip.mp4".into(),
                checksum: "abc".into(),
            },
            &store,
        );
        asset.transition(AssetState::Missing).unwrap();

        let record = AssetRecord::from_asset(&asset);
        assert_eq!(record.filename, "clip.mp4");
        assert_eq!(record.kind, MediaKind::Video);
        assert_eq!(record.state, AssetState::Missing);
        assert_eq!(record.download_attempts, 0);
    }

    #[test]
    fn summary_other_count() {
        let summary = LedgerSummary {
            total_assets: 10,
            valid: 6,
            failed: 1,
            applied_version: None,
            failure_streak: 0,
            last_sync_started: None,
            last_sync_completed: None,
            last_outcome: None,
        };
        assert_eq!(summary.other(), 3);
    }
}
