//! Media downloader: fetches Missing and Mismatched assets into the store.
//!
//! Each asset is downloaded independently with bounded concurrency. A failed
//! asset is reported and signalled but never stops its siblings; what to do
//! about repeated failures is the coordinator's decision.

pub mod error;
pub mod file;

use std::io::IsTerminal;

use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;

use crate::events::{DisplayEvent, EventSink};
use crate::media::{AssetState, MediaAsset, MediaStore};
use crate::retry::RetryPolicy;

/// Settings for a download pass.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub media_base_url: String,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub no_progress_bar: bool,
}

/// An asset that could not be obtained, with the reason for the log and the
/// ledger.
#[derive(Debug, Clone)]
pub struct FailedAsset {
    pub asset: MediaAsset,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub downloaded: Vec<MediaAsset>,
    pub failed: Vec<FailedAsset>,
    pub bytes: u64,
}

impl DownloadReport {
    pub fn failed_filenames(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.asset.filename.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(client: Client, config: DownloadConfig) -> Self {
        Self { client, config }
    }

    /// Remote URL of `filename`, encoded as a single path segment.
    pub fn asset_url(&self, filename: &str) -> String {
        format!(
            "{}/{}",
            self.config.media_base_url.trim_end_matches('/'),
            urlencoding::encode(filename)
        )
    }

    /// Download every asset in `assets` that needs it. Assets in any other
    /// state are ignored.
    pub async fn download_assets(
        &self,
        store: &MediaStore,
        assets: Vec<MediaAsset>,
        events: &EventSink,
    ) -> DownloadReport {
        let queue: Vec<MediaAsset> = assets
            .into_iter()
            .filter(|a| a.state().needs_download())
            .collect();
        if queue.is_empty() {
            return DownloadReport::default();
        }

        if let Err(e) = store.remove_partials() {
            tracing::warn!(error = %e, "Could not clean partial downloads");
        }

        tracing::info!(count = queue.len(), "Downloading media");
        let pb = create_progress_bar(self.config.no_progress_bar, queue.len() as u64);

        let results: Vec<(MediaAsset, Result<u64, String>)> = stream::iter(queue)
            .map(|asset| self.download_one(store, asset))
            .buffer_unordered(self.config.concurrency.max(1))
            .inspect(|_| pb.inc(1))
            .collect()
            .await;
        pb.finish_and_clear();

        let mut report = DownloadReport::default();
        for (mut asset, result) in results {
            match result {
                Ok(bytes) => {
                    report.bytes += bytes;
                    if let Err(e) = asset.transition(AssetState::Valid) {
                        tracing::warn!(error = %e, "Unexpected download state");
                    }
                    report.downloaded.push(asset);
                }
                Err(reason) => {
                    pb.suspend(|| {
                        tracing::error!(filename = %asset.filename, %reason, "Download failed");
                    });
                    if let Err(e) = asset.transition(AssetState::Failed) {
                        tracing::warn!(error = %e, "Unexpected download state");
                    }
                    events.emit(DisplayEvent::DownloadFailed {
                        filename: asset.filename.clone(),
                        reason: reason.clone(),
                    });
                    report.failed.push(FailedAsset { asset, reason });
                }
            }
        }

        tracing::info!(
            downloaded = report.downloaded.len(),
            failed = report.failed.len(),
            bytes = report.bytes,
            "Download pass finished"
        );
        report
    }

    async fn download_one(
        &self,
        store: &MediaStore,
        mut asset: MediaAsset,
    ) -> (MediaAsset, Result<u64, String>) {
        if let Err(e) = asset.transition(AssetState::Downloading) {
            return (asset, Err(e.to_string()));
        }
        let url = self.asset_url(&asset.filename);
        tracing::debug!(%url, path = %asset.local_path.display(), "downloading");

        let result = file::download_file(
            &self.client,
            &url,
            &asset.local_path,
            &store.part_path_for(&asset.filename),
            &asset.expected_checksum,
            &self.config.retry,
        )
        .await
        .map_err(|e| e.to_string());
        (asset, result)
    }
}

/// Progress bar for interactive runs; hidden when disabled or when stdout is
/// not a terminal (service mode).
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}
