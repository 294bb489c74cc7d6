//! Sync orchestration: the session pipeline, its phase machine, the recovery
//! policy and the coordinator loop that ties them to triggers and the
//! display.

pub mod coordinator;
pub mod error;
pub mod recovery;
pub mod session;
pub mod state;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

pub use coordinator::{Command, CoordinatorHandle, SyncCoordinator};
pub use error::SyncError;
pub use recovery::{RecoveryAction, DEFAULT_FAILURE_THRESHOLD};
pub use session::{SessionGuard, SessionLock};
pub use state::{AppliedVersion, Connectivity, EngineState, OfflineMode, PhaseEvent, SyncPhase};
pub use sync::{EngineConfig, SessionPlan, SessionReport, SyncEngine};
