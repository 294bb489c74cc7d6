use thiserror::Error;

use crate::bundle::BundleError;
use crate::manifest::ManifestError;
use crate::state::StateError;

/// Why a sync session did not fully succeed.
///
/// None of these are fatal to the engine: each degrades to serving the last
/// good bundle (or the placeholder) and retrying on a later trigger.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(#[from] ManifestError),

    #[error("{count} media download(s) failed")]
    DownloadFailed { count: usize },

    #[error("Page archiving failed: {0}")]
    ArchiveFailed(String),

    #[error("Media store over quota ({used} > {limit} bytes), cache evicted")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("Cache is corrupt: {0}")]
    CorruptCache(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Ledger error: {0}")]
    State(#[from] StateError),
}

impl From<BundleError> for SyncError {
    fn from(e: BundleError) -> Self {
        match e {
            BundleError::Archive(e) => Self::ArchiveFailed(e.to_string()),
            BundleError::Corrupt(msg) => Self::CorruptCache(msg),
            BundleError::Io(e) => Self::Io(e),
        }
    }
}
