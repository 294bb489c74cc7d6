//! Coordinator state: the sync pipeline phase machine and the values that
//! survive between sessions.

use std::path::Path;

use crate::events::DisplayTarget;

/// Pipeline phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Bootstrapping,
    CheckingConnectivity,
    SyncingManifest,
    VerifyingMedia,
    DownloadingMedia,
    BuildingBundle,
    CacheReady,
}

/// Progress reported by a session (or the coordinator itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Bootstrapped,
    VersionChanged,
    ForcedRefresh,
    VersionUnchanged,
    ManifestFetched,
    MediaVerified { needs_download: bool },
    MediaDownloaded,
    BundlePublished,
    BundleSkipped,
    StageFailed,
}

impl SyncPhase {
    /// The phase after `event`, or `None` if the event is not valid here.
    pub fn next(self, event: PhaseEvent) -> Option<SyncPhase> {
        use PhaseEvent as E;
        use SyncPhase as P;

        match (self, event) {
            (_, E::StageFailed) => Some(P::CheckingConnectivity),
            (P::Bootstrapping, E::Bootstrapped) => Some(P::CheckingConnectivity),
            (P::CheckingConnectivity | P::CacheReady, E::VersionChanged | E::ForcedRefresh) => {
                Some(P::SyncingManifest)
            }
            (P::CheckingConnectivity | P::CacheReady, E::VersionUnchanged) => Some(P::CacheReady),
            (P::SyncingManifest, E::ManifestFetched) => Some(P::VerifyingMedia),
            (P::VerifyingMedia, E::MediaVerified { needs_download: true }) => {
                Some(P::DownloadingMedia)
            }
            (P::VerifyingMedia, E::MediaVerified { needs_download: false }) => {
                Some(P::BuildingBundle)
            }
            (P::DownloadingMedia, E::MediaDownloaded) => Some(P::BuildingBundle),
            (P::BuildingBundle, E::BundlePublished | E::BundleSkipped) => Some(P::CacheReady),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrapping => "bootstrapping",
            Self::CheckingConnectivity => "checking_connectivity",
            Self::SyncingManifest => "syncing_manifest",
            Self::VerifyingMedia => "verifying_media",
            Self::DownloadingMedia => "downloading_media",
            Self::BuildingBundle => "building_bundle",
            Self::CacheReady => "cache_ready",
        }
    }
}

/// Last connectivity signal received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Unknown,
    Online,
    Offline,
}

/// What the display does while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineMode {
    ServingStaleCache,
    AwaitingConnectivity,
}

/// Manifest version reflected by the published bundle. `Unknown` compares
/// unequal to every remote version, which forces a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedVersion {
    Unknown,
    At(i64),
}

impl AppliedVersion {
    pub fn is_current(&self, remote: i64) -> bool {
        matches!(self, Self::At(v) if *v == remote)
    }

    pub fn as_option(&self) -> Option<i64> {
        match self {
            Self::Unknown => None,
            Self::At(v) => Some(*v),
        }
    }
}

impl From<Option<i64>> for AppliedVersion {
    fn from(v: Option<i64>) -> Self {
        v.map_or(Self::Unknown, Self::At)
    }
}

/// Everything the coordinator knows, owned by its loop.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub phase: SyncPhase,
    pub connectivity: Connectivity,
    pub applied_version: AppliedVersion,
    /// Consecutive sessions that ended with failed downloads.
    pub failure_streak: u32,
    pub status_text: String,
    pub bundle_published: bool,
    /// Set by the recovery policy; the next session starts with a wipe.
    pub pending_wipe: bool,
    /// Last target sent to the display.
    pub serving: Option<DisplayTarget>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Bootstrapping,
            connectivity: Connectivity::Unknown,
            applied_version: AppliedVersion::Unknown,
            failure_streak: 0,
            status_text: String::new(),
            bundle_published: false,
            pending_wipe: false,
            serving: None,
        }
    }
}

impl EngineState {
    /// Advance the phase. Returns false (and leaves the phase alone) for an
    /// event the table has no edge for.
    pub fn apply(&mut self, event: PhaseEvent) -> bool {
        match self.phase.next(event) {
            Some(next) => {
                if next != self.phase {
                    tracing::debug!(from = self.phase.as_str(), to = next.as_str(), ?event, "Phase");
                }
                self.phase = next;
                true
            }
            None => {
                tracing::debug!(phase = self.phase.as_str(), ?event, "Ignoring event");
                false
            }
        }
    }

    pub fn is_offline(&self) -> bool {
        self.connectivity == Connectivity::Offline
    }

    /// Effective sub-state while offline, `None` when not offline.
    pub fn offline_mode(&self) -> Option<OfflineMode> {
        if !self.is_offline() {
            return None;
        }
        Some(if self.bundle_published {
            OfflineMode::ServingStaleCache
        } else {
            OfflineMode::AwaitingConnectivity
        })
    }

    /// The cached target: the bundle if one is published, else the
    /// placeholder.
    pub fn cached_target(&self, index: &Path) -> DisplayTarget {
        if self.bundle_published {
            DisplayTarget::Bundle(index.to_path_buf())
        } else {
            DisplayTarget::Placeholder
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PhaseEvent as E;
    use SyncPhase as P;

    #[test]
    fn happy_path_walks_the_pipeline() {
        let mut state = EngineState::default();
        for event in [
            E::Bootstrapped,
            E::VersionChanged,
            E::ManifestFetched,
            E::MediaVerified {
                needs_download: true,
            },
            E::MediaDownloaded,
            E::BundlePublished,
        ] {
            assert!(state.apply(event), "{event:?} from {:?}", state.phase);
        }
        assert_eq!(state.phase, P::CacheReady);
    }

    #[test]
    fn verified_media_skips_download_phase() {
        assert_eq!(
            P::VerifyingMedia.next(E::MediaVerified {
                needs_download: false
            }),
            Some(P::BuildingBundle)
        );
    }

    #[test]
    fn unchanged_version_stays_ready() {
        assert_eq!(P::CacheReady.next(E::VersionUnchanged), Some(P::CacheReady));
        assert_eq!(
            P::CheckingConnectivity.next(E::VersionUnchanged),
            Some(P::CacheReady)
        );
        assert_eq!(P::CacheReady.next(E::ForcedRefresh), Some(P::SyncingManifest));
    }

    #[test]
    fn any_phase_fails_back_to_connectivity_check() {
        for phase in [
            P::Bootstrapping,
            P::SyncingManifest,
            P::VerifyingMedia,
            P::DownloadingMedia,
            P::BuildingBundle,
            P::CacheReady,
        ] {
            assert_eq!(phase.next(E::StageFailed), Some(P::CheckingConnectivity));
        }
    }

    #[test]
    fn events_outside_the_table_are_ignored() {
        assert_eq!(P::Bootstrapping.next(E::ManifestFetched), None);
        assert_eq!(P::SyncingManifest.next(E::BundlePublished), None);
        assert_eq!(P::DownloadingMedia.next(E::VersionChanged), None);

        let mut state = EngineState::default();
        assert!(!state.apply(E::MediaDownloaded));
        assert_eq!(state.phase, P::Bootstrapping);
    }

    #[test]
    fn applied_version_comparison() {
        assert!(!AppliedVersion::Unknown.is_current(0));
        assert!(AppliedVersion::At(5).is_current(5));
        assert!(!AppliedVersion::At(5).is_current(6));
        assert_eq!(AppliedVersion::from(Some(3)), AppliedVersion::At(3));
        assert_eq!(AppliedVersion::from(None), AppliedVersion::Unknown);
    }

    #[test]
    fn offline_mode_depends_on_bundle() {
        let mut state = EngineState::default();
        assert_eq!(state.offline_mode(), None);

        state.connectivity = Connectivity::Offline;
        assert_eq!(state.offline_mode(), Some(OfflineMode::AwaitingConnectivity));
        assert_eq!(
            state.cached_target(Path::new("/d/current/index.html")),
            DisplayTarget::Placeholder
        );

        state.bundle_published = true;
        assert_eq!(state.offline_mode(), Some(OfflineMode::ServingStaleCache));
        assert_eq!(
            state.cached_target(Path::new("/d/current/index.html")),
            DisplayTarget::Bundle("/d/current/index.html".into())
        );
    }
}
