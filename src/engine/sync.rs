//! One sync session: quota, status, manifest, verify, download, build.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::error::SyncError;
use super::session::SessionGuard;
use super::state::{AppliedVersion, PhaseEvent};
use crate::bundle::{BundleBuilder, BundleLayout, PageArchiver, PublishedBundle};
use crate::download::{DownloadConfig, Downloader};
use crate::events::{DisplayEvent, EventSink};
use crate::manifest::{http_client, ManifestClient};
use crate::media::{AssetState, MediaAsset, MediaStore};
use crate::quota::{QuotaManager, QuotaOutcome};
use crate::retry::RetryPolicy;
use crate::state::{AssetRecord, RunTrigger, StateDb, SyncRunStats};
use crate::verify::{verify_manifest, VerificationReport};

/// Everything the engine needs to know about its environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub device_id: String,
    pub media_base_url: String,
    pub slideshow_url: String,
    pub data_dir: PathBuf,
    pub quota_bytes: u64,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub no_progress_bar: bool,
}

impl EngineConfig {
    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }
}

/// Inputs of a session, decided by whoever started it.
#[derive(Debug, Clone, Copy)]
pub struct SessionPlan {
    pub trigger: RunTrigger,
    /// Version the published bundle reflects when the session starts.
    pub applied: AppliedVersion,
    /// Evict the whole cache before syncing.
    pub wipe: bool,
}

impl SessionPlan {
    /// Whether the session syncs even when the remote version is unchanged.
    pub fn forced(&self) -> bool {
        self.wipe || self.trigger != RunTrigger::Poll
    }
}

/// What a session did. Sent back to the coordinator when it ends.
#[derive(Debug)]
pub struct SessionReport {
    pub trigger: RunTrigger,
    pub modified_on: Option<i64>,
    pub wiped: bool,
    pub assets_seen: usize,
    pub downloaded: usize,
    pub failed: Vec<String>,
    pub bytes: u64,
    pub published: Option<PublishedBundle>,
    /// Applied version after the session.
    pub applied: AppliedVersion,
    pub error: Option<SyncError>,
    pub elapsed: Duration,
}

impl SessionReport {
    #[cfg(test)]
    pub(crate) fn for_test(plan: &SessionPlan) -> Self {
        Self::new(plan)
    }

    fn new(plan: &SessionPlan) -> Self {
        Self {
            trigger: plan.trigger,
            modified_on: None,
            wiped: false,
            assets_seen: 0,
            downloaded: 0,
            failed: Vec::new(),
            bytes: 0,
            published: None,
            applied: plan.applied,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn outcome(&self) -> &'static str {
        match &self.error {
            None if self.published.is_some() => "published",
            None if self.assets_seen == 0 && self.modified_on.is_some() => "unchanged",
            None => "synced",
            Some(SyncError::NetworkUnavailable(_)) => "deferred",
            Some(SyncError::DownloadFailed { .. }) => "incomplete",
            Some(SyncError::QuotaExceeded { .. }) => "evicted",
            Some(_) => "failed",
        }
    }

    fn run_stats(&self) -> SyncRunStats {
        SyncRunStats {
            modified_on: self.modified_on,
            assets_seen: self.assets_seen as u64,
            assets_downloaded: self.downloaded as u64,
            assets_failed: self.failed.len() as u64,
            bundle_generation: self.published.as_ref().map(|p| p.generation.clone()),
            outcome: self.outcome().to_string(),
        }
    }
}

/// The sync pipeline. Stateless between sessions apart from the disk and
/// the ledger.
pub struct SyncEngine {
    manifest: ManifestClient,
    store: MediaStore,
    downloader: Downloader,
    quota: QuotaManager,
    builder: BundleBuilder,
    ledger: Arc<dyn StateDb>,
    events: EventSink,
    slideshow_url: String,
    concurrency: usize,
}

impl SyncEngine {
    pub fn new(
        config: &EngineConfig,
        archiver: Arc<dyn PageArchiver>,
        ledger: Arc<dyn StateDb>,
        events: EventSink,
    ) -> Result<Self, SyncError> {
        let client = http_client(config.request_timeout).map_err(std::io::Error::other)?;
        let store = MediaStore::open(config.media_dir())?;
        let layout = BundleLayout::new(&config.data_dir);
        let downloader = Downloader::new(
            client.clone(),
            DownloadConfig {
                media_base_url: config.media_base_url.clone(),
                concurrency: config.concurrency,
                retry: config.retry,
                no_progress_bar: config.no_progress_bar,
            },
        );
        Ok(Self {
            manifest: ManifestClient::new(client, &config.base_url, &config.device_id),
            quota: QuotaManager::new(store.clone(), layout.clone(), config.quota_bytes),
            builder: BundleBuilder::new(archiver, layout),
            store,
            downloader,
            ledger,
            events,
            slideshow_url: config.slideshow_url.clone(),
            concurrency: config.concurrency.max(1),
        })
    }

    pub fn layout(&self) -> &BundleLayout {
        self.builder.layout()
    }

    pub fn ledger(&self) -> &Arc<dyn StateDb> {
        &self.ledger
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn slideshow_url(&self) -> &str {
        &self.slideshow_url
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub async fn probe(&self) -> bool {
        self.manifest.probe().await
    }

    /// Applied version to resume from. Only trusted while a bundle is
    /// published; otherwise the ledger is reset and the result is Unknown.
    pub async fn restore_applied_version(&self) -> AppliedVersion {
        if !self.layout().is_published() {
            if let Err(e) = self.ledger.set_applied_version(None).await {
                tracing::warn!(error = %e, "Failed to reset applied version");
            }
            return AppliedVersion::Unknown;
        }
        match self.ledger.applied_version().await {
            Ok(v) => v.into(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read applied version");
                AppliedVersion::Unknown
            }
        }
    }

    /// Fetch the manifest and classify the store without changing anything.
    pub async fn verify_only(&self) -> Result<VerificationReport, SyncError> {
        let modified_on = self.manifest.get_status().await?;
        let manifest = self.manifest.get_manifest(modified_on).await?;
        Ok(verify_manifest(&self.store, &manifest, self.concurrency).await)
    }

    /// Delete all cached media and bundles and forget the applied version.
    pub async fn evict(&self, guard: &SessionGuard) -> Result<(), SyncError> {
        self.quota.evict_all(guard).await?;
        self.forget_cache().await;
        Ok(())
    }

    /// One forced session outside the coordinator (CLI `sync`).
    pub async fn sync_once(&self, guard: &SessionGuard, wipe: bool) -> SessionReport {
        let plan = SessionPlan {
            trigger: if wipe {
                RunTrigger::Resync
            } else {
                RunTrigger::Manual
            },
            applied: self.restore_applied_version().await,
            wipe,
        };
        self.run_session(guard, plan, &|event| tracing::debug!(?event, "Phase"))
            .await
    }

    /// Run a full session. Never fails as a whole: the outcome, including
    /// any error, is in the report. `progress` receives phase events in
    /// order.
    pub async fn run_session(
        &self,
        guard: &SessionGuard,
        plan: SessionPlan,
        progress: &(dyn Fn(PhaseEvent) + Send + Sync),
    ) -> SessionReport {
        let run_id = match self.ledger.start_sync_run(plan.trigger).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to record sync run start");
                None
            }
        };

        let mut report = SessionReport::new(&plan);
        if let Err(e) = self.session_body(guard, &plan, progress, &mut report).await {
            if !matches!(e, SyncError::DownloadFailed { .. }) {
                progress(PhaseEvent::StageFailed);
            }
            report.error = Some(e);
        }
        report.elapsed = guard.elapsed();

        if let Some(run_id) = run_id {
            if let Err(e) = self.ledger.complete_sync_run(run_id, &report.run_stats()).await {
                tracing::warn!(error = %e, "Failed to record sync run completion");
            }
        }

        match &report.error {
            None => tracing::info!(
                trigger = plan.trigger.as_str(),
                outcome = report.outcome(),
                downloaded = report.downloaded,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Sync session finished"
            ),
            Some(e) => tracing::warn!(
                trigger = plan.trigger.as_str(),
                outcome = report.outcome(),
                error = %e,
                "Sync session did not complete"
            ),
        }
        report
    }

    async fn session_body(
        &self,
        guard: &SessionGuard,
        plan: &SessionPlan,
        progress: &(dyn Fn(PhaseEvent) + Send + Sync),
        report: &mut SessionReport,
    ) -> Result<(), SyncError> {
        if plan.wipe {
            self.events.status("Resetting media cache");
            self.evict(guard).await?;
            report.wiped = true;
            report.applied = AppliedVersion::Unknown;
        } else if let QuotaOutcome::Evicted { used } = self.quota.enforce(guard).await? {
            self.forget_cache().await;
            report.applied = AppliedVersion::Unknown;
            return Err(SyncError::QuotaExceeded {
                used,
                limit: self.quota.limit_bytes(),
            });
        }

        let modified_on = self.manifest.get_status().await?;
        report.modified_on = Some(modified_on);
        let changed = !report.applied.is_current(modified_on);
        if !changed && !plan.forced() {
            progress(PhaseEvent::VersionUnchanged);
            return Ok(());
        }
        progress(if changed {
            PhaseEvent::VersionChanged
        } else {
            PhaseEvent::ForcedRefresh
        });
        tracing::info!(
            modified_on,
            applied = ?report.applied.as_option(),
            trigger = plan.trigger.as_str(),
            "Syncing manifest"
        );

        self.events.status("Fetching playlist");
        let manifest = self.manifest.get_manifest(modified_on).await?;
        progress(PhaseEvent::ManifestFetched);

        let verification = verify_manifest(&self.store, &manifest, self.concurrency).await;
        report.assets_seen = verification.assets.len();
        let to_download = verification.to_download();
        tracing::info!(
            valid = verification.count(AssetState::Valid),
            missing = verification.count(AssetState::Missing),
            mismatched = verification.count(AssetState::Mismatched),
            "Media verified"
        );
        progress(PhaseEvent::MediaVerified {
            needs_download: !to_download.is_empty(),
        });
        let records: Vec<AssetRecord> =
            verification.assets.iter().map(AssetRecord::from_asset).collect();
        if let Err(e) = self.ledger.record_assets(&records).await {
            tracing::warn!(error = %e, "Failed to record verification");
        }

        let mut fresh: HashMap<String, MediaAsset> = HashMap::new();
        if !to_download.is_empty() {
            self.events
                .status(format!("Downloading {} media file(s)", to_download.len()));
            let downloads = self
                .downloader
                .download_assets(&self.store, to_download, &self.events)
                .await;
            progress(PhaseEvent::MediaDownloaded);

            report.downloaded = downloads.downloaded.len();
            report.bytes = downloads.bytes;
            report.failed = downloads.failed_filenames();
            self.record_downloads(&downloads.downloaded, &downloads.failed)
                .await;
            if !report.failed.is_empty() {
                self.events.emit(DisplayEvent::MediaMissing {
                    filenames: report.failed.clone(),
                });
            }
            fresh = downloads
                .downloaded
                .into_iter()
                .map(|a| (a.filename.clone(), a))
                .collect();
        }

        // Manifest order matters for positional rewriting. Assets that are
        // still not Valid stay in the list so references to them become
        // placeholders instead of remote URLs.
        let usable: Vec<MediaAsset> = verification
            .assets
            .into_iter()
            .map(|a| {
                if a.state() == AssetState::Valid {
                    a
                } else {
                    fresh.remove(&a.filename).unwrap_or(a)
                }
            })
            .collect();

        let needs_build =
            changed || report.downloaded > 0 || report.wiped || !self.layout().is_published();
        if needs_build {
            self.events.status("Saving slideshow for offline use");
            let generation = format!("{modified_on}-{}", Utc::now().timestamp_millis());
            let published = self
                .builder
                .build(guard, &self.slideshow_url, &generation, &usable)
                .await?;
            progress(PhaseEvent::BundlePublished);
            tracing::info!(
                generation = %published.generation,
                rewritten = published.rewritten,
                placeholders = published.placeholders,
                "Offline bundle published"
            );
            self.events.emit(DisplayEvent::CacheReady {
                index: published.index.clone(),
            });
            report.published = Some(published);
        } else {
            progress(PhaseEvent::BundleSkipped);
        }

        if !report.failed.is_empty() {
            return Err(SyncError::DownloadFailed {
                count: report.failed.len(),
            });
        }

        report.applied = AppliedVersion::At(modified_on);
        if let Err(e) = self.ledger.set_applied_version(Some(modified_on)).await {
            tracing::warn!(error = %e, "Failed to persist applied version");
        }
        self.events.status("Slideshow up to date");
        Ok(())
    }

    async fn record_downloads(
        &self,
        downloaded: &[MediaAsset],
        failed: &[crate::download::FailedAsset],
    ) {
        let mut valid = Vec::with_capacity(downloaded.len());
        for asset in downloaded {
            let size = tokio::fs::metadata(&asset.local_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            valid.push((asset.filename.clone(), size));
        }
        if let Err(e) = self.ledger.mark_valid_batch(&valid).await {
            tracing::warn!(error = %e, "Failed to record downloaded assets");
        }
        let failed: Vec<(String, String)> = failed
            .iter()
            .map(|f| (f.asset.filename.clone(), f.reason.clone()))
            .collect();
        if let Err(e) = self.ledger.mark_failed_batch(&failed).await {
            tracing::warn!(error = %e, "Failed to record failed assets");
        }
    }

    /// Ledger side of an eviction.
    async fn forget_cache(&self) {
        if let Err(e) = self.ledger.clear_assets().await {
            tracing::warn!(error = %e, "Failed to clear asset ledger");
        }
        if let Err(e) = self.ledger.set_applied_version(None).await {
            tracing::warn!(error = %e, "Failed to reset applied version");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::*;
    use crate::engine::SessionLock;

    #[tokio::test]
    async fn two_ads_four_images_publish_once() {
        let server = Server::start(100, &["a.jpg", "b.jpg", "c.jpg", "d.jpg"]).await;
        server.expect_media(1).await;
        let mut h = Harness::new(&server, u64::MAX).await;
        let lock = SessionLock::new();
        let guard = lock.try_begin().unwrap();

        let report = h.engine.sync_once(&guard, false).await;
        assert!(report.is_success(), "{:?}", report.error);
        assert_eq!(report.assets_seen, 4);
        assert_eq!(report.downloaded, 4);
        assert_eq!(report.applied, AppliedVersion::At(100));
        let published = report.published.expect("bundle published");
        assert_eq!(published.rewritten, 4);
        assert_eq!(published.placeholders, 0);

        let html = std::fs::read_to_string(h.engine.layout().current_index()).unwrap();
        for name in ["a.jpg", "b.jpg", "c.jpg", "d.jpg"] {
            assert!(html.contains(&format!("media/{name}")), "{html}");
            assert!(h.engine.layout().current().join("media").join(name).is_file());
        }

        let events = h.drain_events();
        let ready = events
            .iter()
            .filter(|e| matches!(e, DisplayEvent::CacheReady { .. }))
            .count();
        assert_eq!(ready, 1);
        assert_eq!(
            h.engine.ledger().applied_version().await.unwrap(),
            Some(100)
        );
    }

    #[tokio::test]
    async fn second_cycle_without_changes_fetches_nothing() {
        let server = Server::start(100, &["a.jpg", "b.jpg"]).await;
        server.expect_media(1).await;
        let mut h = Harness::new(&server, u64::MAX).await;
        let lock = SessionLock::new();
        let guard = lock.try_begin().unwrap();

        let first = h.engine.sync_once(&guard, false).await;
        assert!(first.is_success());
        let generation = h.engine.layout().current_generation();
        h.drain_events();

        // Unchanged version on a poll: no manifest work at all.
        let plan = SessionPlan {
            trigger: RunTrigger::Poll,
            applied: first.applied,
            wipe: false,
        };
        let polled = h.engine.run_session(&guard, plan, &|_| {}).await;
        assert!(polled.is_success());
        assert!(polled.published.is_none());
        assert_eq!(polled.assets_seen, 0);

        // Forced refresh: everything verifies, nothing is fetched or rebuilt.
        let forced = h.engine.sync_once(&guard, false).await;
        assert!(forced.is_success());
        assert_eq!(forced.assets_seen, 2);
        assert_eq!(forced.downloaded, 0);
        assert!(forced.published.is_none());
        assert_eq!(h.engine.layout().current_generation(), generation);
        assert!(!h
            .drain_events()
            .iter()
            .any(|e| matches!(e, DisplayEvent::CacheReady { .. })));
        // Media mocks expect exactly one request each; checked on drop.
    }

    #[tokio::test]
    async fn version_change_rebuilds_without_redownloading() {
        let server = Server::start(100, &["a.jpg"]).await;
        server.expect_media(1).await;
        let h = Harness::new(&server, u64::MAX).await;
        let lock = SessionLock::new();
        let guard = lock.try_begin().unwrap();
        assert!(h.engine.sync_once(&guard, false).await.is_success());

        let plan = SessionPlan {
            trigger: RunTrigger::Poll,
            applied: AppliedVersion::At(99),
            wipe: false,
        };
        let report = h.engine.run_session(&guard, plan, &|_| {}).await;
        assert!(report.is_success());
        assert_eq!(report.downloaded, 0);
        assert!(report.published.is_some());
        assert_eq!(report.applied, AppliedVersion::At(100));
    }

    #[tokio::test]
    async fn over_quota_evicts_and_resets_applied_version() {
        let server = Server::start(100, &["a.jpg"]).await;
        let h = Harness::new(&server, 10).await;
        std::fs::write(h.media_dir().join("old.mp4"), vec![0u8; 64]).unwrap();
        h.engine
            .ledger()
            .set_applied_version(Some(50))
            .await
            .unwrap();

        let lock = SessionLock::new();
        let guard = lock.try_begin().unwrap();
        let plan = SessionPlan {
            trigger: RunTrigger::Poll,
            applied: AppliedVersion::At(50),
            wipe: false,
        };
        let report = h.engine.run_session(&guard, plan, &|_| {}).await;

        assert!(matches!(
            report.error,
            Some(SyncError::QuotaExceeded { used: 64, limit: 10 })
        ));
        assert_eq!(report.applied, AppliedVersion::Unknown);
        assert_eq!(crate::quota::measure(&h.media_dir()).unwrap(), 0);
        assert_eq!(h.engine.ledger().applied_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_download_keeps_version_and_signals_missing() {
        let server = Server::start(100, &["a.jpg", "b.jpg"]).await;
        server.serve_media("a.jpg").await;
        server.fail_media("b.jpg", 404).await;
        let mut h = Harness::new(&server, u64::MAX).await;
        let lock = SessionLock::new();
        let guard = lock.try_begin().unwrap();

        let report = h.engine.sync_once(&guard, false).await;
        assert!(matches!(
            report.error,
            Some(SyncError::DownloadFailed { count: 1 })
        ));
        assert_eq!(report.failed, vec!["b.jpg"]);
        assert_eq!(report.applied, AppliedVersion::Unknown);
        // The bundle is still built from what is available.
        let published = report.published.expect("partial bundle");
        assert_eq!(published.placeholders, 1);

        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            DisplayEvent::MediaMissing { filenames } if filenames == &vec!["b.jpg".to_string()]
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            DisplayEvent::DownloadFailed { filename, .. } if filename == "b.jpg"
        )));
        let failed = h.engine.ledger().get_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_server_is_network_unavailable() {
        let h = Harness::unreachable().await;
        let lock = SessionLock::new();
        let guard = lock.try_begin().unwrap();
        let events = std::sync::Mutex::new(Vec::new());
        let plan = SessionPlan {
            trigger: RunTrigger::Poll,
            applied: AppliedVersion::At(7),
            wipe: false,
        };

        let report = h
            .engine
            .run_session(&guard, plan, &|e| events.lock().unwrap().push(e))
            .await;
        assert!(matches!(
            report.error,
            Some(SyncError::NetworkUnavailable(_))
        ));
        assert_eq!(report.applied, AppliedVersion::At(7));
        assert_eq!(events.into_inner().unwrap(), vec![PhaseEvent::StageFailed]);
    }

    #[tokio::test]
    async fn wipe_evicts_before_resyncing() {
        let server = Server::start(100, &["a.jpg"]).await;
        server.expect_media(2).await;
        let h = Harness::new(&server, u64::MAX).await;
        let lock = SessionLock::new();
        let guard = lock.try_begin().unwrap();
        assert!(h.engine.sync_once(&guard, false).await.is_success());

        let report = h.engine.sync_once(&guard, true).await;
        assert!(report.is_success());
        assert!(report.wiped);
        assert_eq!(report.downloaded, 1);
        assert!(report.published.is_some());
    }
}
