//! Integrity verification of the media store against a manifest.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use futures_util::stream::{self, StreamExt};

use crate::manifest::{AdEntry, Manifest};
use crate::media::{AssetState, MediaAsset, MediaStore};

/// Lowercase hex MD5 of a file, streamed.
pub fn md5_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    std::io::copy(&mut file, &mut context)?;
    Ok(format!("{:x}", context.compute()))
}

/// Classify one local file against its declared checksum.
///
/// An empty expected checksum cannot be compared, so a present file is
/// accepted as valid.
pub fn classify_file(path: &Path, expected: &str) -> std::io::Result<AssetState> {
    let actual = match md5_file(path) {
        Ok(sum) => sum,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(AssetState::Missing),
        Err(e) => return Err(e),
    };
    if expected.is_empty() {
        tracing::debug!(path = %path.display(), "No declared checksum, accepting file as-is");
        return Ok(AssetState::Valid);
    }
    if actual.eq_ignore_ascii_case(expected) {
        Ok(AssetState::Valid)
    } else {
        tracing::info!(
            path = %path.display(),
            on_disk = %actual,
            declared = %expected,
            "Checksum mismatch"
        );
        Ok(AssetState::Mismatched)
    }
}

/// Per-asset classification for one manifest, in manifest order.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub assets: Vec<MediaAsset>,
}

impl VerificationReport {
    pub fn to_download(&self) -> Vec<MediaAsset> {
        self.assets
            .iter()
            .filter(|a| a.state().needs_download())
            .cloned()
            .collect()
    }

    pub fn count(&self, state: AssetState) -> usize {
        self.assets.iter().filter(|a| a.state() == state).count()
    }

    /// Classification of an entry's two image slots. `None` for an empty slot
    /// or a filename that was rejected from the manifest.
    pub fn entry_states(&self, entry: &AdEntry) -> [Option<AssetState>; 2] {
        let by_name: HashMap<&str, AssetState> = self
            .assets
            .iter()
            .map(|a| (a.filename.as_str(), a.state()))
            .collect();
        let lookup = |name: &str| by_name.get(name.trim()).copied();
        [lookup(&entry.first_image), lookup(&entry.second_image)]
    }
}

/// Hash every manifest asset present in the store, at most `concurrency`
/// files at a time.
pub async fn verify_manifest(
    store: &MediaStore,
    manifest: &Manifest,
    concurrency: usize,
) -> VerificationReport {
    let assets: Vec<MediaAsset> = manifest
        .assets()
        .iter()
        .map(|a| MediaAsset::new(a, store))
        .collect();

    let assets = stream::iter(assets)
        .map(|mut asset| async move {
            let path = asset.local_path.clone();
            let expected = asset.expected_checksum.clone();
            let state =
                match tokio::task::spawn_blocking(move || classify_file(&path, &expected)).await {
                    Ok(Ok(state)) => state,
                    Ok(Err(e)) => {
                        tracing::warn!(
                            filename = %asset.filename,
                            error = %e,
                            "Could not read media file, scheduling re-download"
                        );
                        AssetState::Mismatched
                    }
                    Err(e) => {
                        tracing::warn!(filename = %asset.filename, error = %e, "Hash task failed");
                        AssetState::Mismatched
                    }
                };
            if let Err(e) = asset.transition(state) {
                tracing::warn!(error = %e, "Unexpected verification state");
            }
            asset
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    VerificationReport { assets }
}
