//! Storage quota for the media store.
//!
//! The policy is deliberately blunt: once the store is over the limit,
//! everything cached is deleted and the next sync rebuilds it from the remote
//! manifest.

use std::io::ErrorKind;
use std::path::Path;

use crate::bundle::BundleLayout;
use crate::engine::SessionGuard;
use crate::media::MediaStore;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_QUOTA_BYTES: u64 = 10 * GIB;

/// Total size in bytes of the regular files under `dir`.
///
/// Directories contribute nothing and symlinks are not followed. On unix a
/// hard-linked file is counted once. A missing directory measures zero.
pub fn measure(dir: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    let mut seen = std::collections::HashSet::new();
    let mut total = 0u64;

    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) {
                    continue;
                }
                return Err(e.into());
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if metadata.nlink() > 1 && !seen.insert((metadata.dev(), metadata.ino())) {
                continue;
            }
        }
        total += metadata.len();
    }
    Ok(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    WithinLimit { used: u64 },
    Evicted { used: u64 },
}

#[derive(Debug, Clone)]
pub struct QuotaManager {
    store: MediaStore,
    layout: BundleLayout,
    limit_bytes: u64,
}

impl QuotaManager {
    pub fn new(store: MediaStore, layout: BundleLayout, limit_bytes: u64) -> Self {
        Self {
            store,
            layout,
            limit_bytes,
        }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub async fn usage(&self) -> std::io::Result<u64> {
        let root = self.store.root().to_path_buf();
        tokio::task::spawn_blocking(move || measure(&root))
            .await
            .map_err(std::io::Error::other)?
    }

    /// Evict everything if the media store is over the limit; otherwise do
    /// nothing.
    pub async fn enforce(&self, guard: &SessionGuard) -> std::io::Result<QuotaOutcome> {
        let used = self.usage().await?;
        if used <= self.limit_bytes {
            tracing::debug!(used, limit = self.limit_bytes, "Media store within quota");
            return Ok(QuotaOutcome::WithinLimit { used });
        }
        tracing::warn!(
            used,
            limit = self.limit_bytes,
            "Media store over quota, evicting all cached content"
        );
        self.evict_all(guard).await?;
        Ok(QuotaOutcome::Evicted { used })
    }

    /// Delete the media store contents, the published bundle, every bundle
    /// generation and the staging area.
    pub async fn evict_all(&self, _guard: &SessionGuard) -> std::io::Result<()> {
        let store = self.store.clone();
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || {
            store.clear()?;
            layout.clear()
        })
        .await
        .map_err(std::io::Error::other)?
    }
}
