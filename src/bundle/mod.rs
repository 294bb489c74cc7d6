//! Offline bundle builder.
//!
//! A build archives the slideshow page into staging, points its media
//! references at verified local assets, checks the result and then publishes
//! it as a new generation. Nothing under `current` is touched until the new
//! generation is complete.

pub mod archiver;
pub mod layout;
pub mod rewrite;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

pub use archiver::{ArchiveError, CommandArchiver, PageArchiver, DEFAULT_ARCHIVER};
pub use layout::BundleLayout;

use crate::engine::SessionGuard;
use crate::media::{AssetState, MediaAsset};
use rewrite::{LocalAsset, MEDIA_DIR};

const INDEX_FILE: &str = "index.html";
const SITE_DIR: &str = "site";
/// Archivers may nest their output (e.g. `site/site.site/index.html`).
const INDEX_SEARCH_DEPTH: usize = 3;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Archiving failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Bundle is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedBundle {
    pub generation: String,
    /// `index.html` under the published location.
    pub index: PathBuf,
    pub rewritten: usize,
    pub placeholders: usize,
}

#[derive(Clone)]
pub struct BundleBuilder {
    archiver: Arc<dyn PageArchiver>,
    layout: BundleLayout,
}

impl BundleBuilder {
    pub fn new(archiver: Arc<dyn PageArchiver>, layout: BundleLayout) -> Self {
        Self { archiver, layout }
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Archive `url`, bind its media to `assets` and publish the result as
    /// `generation`. Only assets in the Valid state are linked into the
    /// bundle; references to the others become placeholders.
    ///
    /// On any error the staging area is discarded and the previously
    /// published bundle stays in place.
    pub async fn build(
        &self,
        _guard: &SessionGuard,
        url: &str,
        generation: &str,
        assets: &[MediaAsset],
    ) -> Result<PublishedBundle, BundleError> {
        let staging = self.layout.staging();
        let reset = staging.clone();
        tokio::task::spawn_blocking(move || reset_dir(&reset))
            .await
            .map_err(std::io::Error::other)??;

        let site = staging.join(SITE_DIR);
        if let Err(e) = self.archiver.archive(url, &site).await {
            discard(&staging);
            return Err(e.into());
        }

        let local: Vec<(LocalAsset, PathBuf)> = assets
            .iter()
            .map(|a| {
                (
                    LocalAsset {
                        filename: a.filename.clone(),
                        kind: a.kind,
                        available: a.state() == AssetState::Valid,
                    },
                    a.local_path.clone(),
                )
            })
            .collect();

        let layout = self.layout.clone();
        let generation = generation.to_string();
        let result = tokio::task::spawn_blocking(move || {
            assemble_and_publish(&layout, &staging, &generation, &local)
        })
        .await
        .map_err(std::io::Error::other)?;

        if result.is_err() {
            discard(&self.layout.staging());
        }
        result
    }
}

fn assemble_and_publish(
    layout: &BundleLayout,
    staging: &Path,
    generation: &str,
    assets: &[(LocalAsset, PathBuf)],
) -> Result<PublishedBundle, BundleError> {
    let index = find_index(staging).ok_or_else(|| {
        BundleError::Corrupt(format!("archiver produced no {INDEX_FILE}"))
    })?;
    let root = index
        .parent()
        .ok_or_else(|| BundleError::Corrupt("index has no parent".into()))?
        .to_path_buf();

    let html = std::fs::read_to_string(&index)?;
    let local: Vec<LocalAsset> = assets.iter().map(|(a, _)| a.clone()).collect();
    let rewrite = rewrite::rewrite_media_refs(&html, &local);

    let media_dir = root.join(MEDIA_DIR);
    std::fs::create_dir_all(&media_dir)?;
    for filename in &rewrite.used {
        let Some((_, source)) = assets
            .iter()
            .find(|(a, _)| a.available && &a.filename == filename)
        else {
            continue;
        };
        link_or_copy(source, &media_dir.join(filename))?;
    }
    std::fs::write(&index, &rewrite.html)?;
    validate(&root)?;

    tracing::info!(
        generation,
        rewritten = rewrite.rewritten,
        placeholders = rewrite.placeholders,
        "Bundle assembled"
    );

    let target = layout.generation_dir(generation);
    if target.exists() {
        std::fs::remove_dir_all(&target)?;
    }
    std::fs::rename(&root, &target)?;

    let previous = layout.current_generation();
    layout.publish(&target)?;
    discard(staging);

    let mut keep = vec![generation];
    if let Some(previous) = previous.as_deref() {
        keep.push(previous);
    }
    match layout.prune(&keep) {
        Ok(0) => {}
        Ok(removed) => tracing::debug!(removed, "Pruned old bundle generations"),
        Err(e) => tracing::warn!(error = %e, "Failed to prune old bundle generations"),
    }

    Ok(PublishedBundle {
        generation: generation.to_string(),
        index: layout.current_index(),
        rewritten: rewrite.rewritten,
        placeholders: rewrite.placeholders,
    })
}

/// Shallowest `index.html` under `dir`.
pub fn find_index(dir: &Path) -> Option<PathBuf> {
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(INDEX_SEARCH_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == INDEX_FILE)
        .min_by_key(|e| e.depth())
        .map(|e| e.into_path())
}

/// Check a bundle root: `index.html` exists and every `media/` reference in
/// it resolves to a file.
pub fn validate(root: &Path) -> Result<(), BundleError> {
    let index = root.join(INDEX_FILE);
    if !index.is_file() {
        return Err(BundleError::Corrupt(format!("{} missing", index.display())));
    }
    let html = std::fs::read_to_string(&index)?;
    for filename in rewrite::media_references(&html) {
        if !root.join(MEDIA_DIR).join(&filename).is_file() {
            return Err(BundleError::Corrupt(format!(
                "referenced media file {filename} missing"
            )));
        }
    }
    Ok(())
}

/// Hard link when the store and the bundle share a filesystem, copy otherwise.
fn link_or_copy(source: &Path, dest: &Path) -> std::io::Result<()> {
    if dest.exists() {
        std::fs::remove_file(dest)?;
    }
    match std::fs::hard_link(source, dest) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(error = %e, src = %source.display(), "Hard link failed, copying");
            std::fs::copy(source, dest).map(|_| ())
        }
    }
}

fn reset_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(dir)
}

fn discard(staging: &Path) {
    if let Err(e) = std::fs::remove_dir_all(staging) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, path = %staging.display(), "Failed to discard staging");
        }
    }
}
