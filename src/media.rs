//! Media store directory and the per-asset lifecycle.
//!
//! The store is a flat directory of files named exactly as the manifest
//! references them. In-flight downloads live next to their target as hidden
//! `.<filename>.part` files and are never listed as assets.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::manifest::AssetRef;
use crate::types::MediaKind;

const PART_SUFFIX: &str = ".part";

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Invalid state transition for {filename}: {from:?} -> {to:?}")]
    InvalidTransition {
        filename: String,
        from: AssetState,
        to: AssetState,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lifecycle of one media asset within a session.
///
/// ```text
/// Unknown ─┬─> Valid
///          ├─> Missing ────┐
///          └─> Mismatched ─┴─> Downloading ─┬─> Valid
///                                           └─> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Unknown,
    Missing,
    Mismatched,
    Valid,
    Downloading,
    Failed,
}

impl AssetState {
    pub fn can_transition_to(self, next: AssetState) -> bool {
        use AssetState::*;
        matches!(
            (self, next),
            (Unknown, Missing | Mismatched | Valid)
                | (Missing | Mismatched, Downloading)
                | (Downloading, Valid | Failed)
        )
    }

    pub fn needs_download(self) -> bool {
        matches!(self, AssetState::Missing | AssetState::Mismatched)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Missing => "missing",
            Self::Mismatched => "mismatched",
            Self::Valid => "valid",
            Self::Downloading => "downloading",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "missing" => Some(Self::Missing),
            "mismatched" => Some(Self::Mismatched),
            "valid" => Some(Self::Valid),
            "downloading" => Some(Self::Downloading),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One manifest-referenced file and where it stands in this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAsset {
    pub filename: String,
    pub expected_checksum: String,
    pub local_path: PathBuf,
    pub kind: MediaKind,
    state: AssetState,
}

impl MediaAsset {
    pub fn new(asset: &AssetRef, store: &MediaStore) -> Self {
        Self {
            filename: asset.filename.clone(),
            expected_checksum: asset.checksum.clone(),
            local_path: store.path_for(&asset.filename),
            kind: MediaKind::from_filename(&asset.filename),
            state: AssetState::Unknown,
        }
    }

    pub fn state(&self) -> AssetState {
        self.state
    }

    pub fn transition(&mut self, next: AssetState) -> Result<(), MediaError> {
        if !self.state.can_transition_to(next) {
            return Err(MediaError::InvalidTransition {
                filename: self.filename.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// The on-disk media directory.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    /// Open the store, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Temporary download target for `filename`. Hidden, so listings and
    /// archivers never pick it up.
    pub fn part_path_for(&self, filename: &str) -> PathBuf {
        self.root.join(format!(".{filename}{PART_SUFFIX}"))
    }

    /// Asset filenames currently present, sorted.
    pub fn list(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete leftover partial downloads from an interrupted run.
    pub fn remove_partials(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(PART_SUFFIX) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Removed stale partial downloads");
        }
        Ok(removed)
    }

    /// Remove everything inside the store, keeping the directory itself.
    pub fn clear(&self) -> std::io::Result<()> {
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}
