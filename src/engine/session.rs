//! The single sync-session token.
//!
//! Every operation that mutates the media store or the published bundle
//! (sync, quota enforcement, eviction) takes a `&SessionGuard`, so none of
//! them can interleave.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::state::RunTrigger;

#[derive(Debug, Clone, Default)]
pub struct SessionLock {
    inner: Arc<Mutex<()>>,
    active: Arc<StdMutex<Option<ActiveSession>>>,
}

/// What the running session was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSession {
    /// `None` for maintenance sessions such as eviction.
    pub trigger: Option<RunTrigger>,
    pub started: Instant,
}

impl ActiveSession {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Proof that the holder owns the only active session. Released on drop.
#[derive(Debug)]
pub struct SessionGuard {
    _guard: OwnedMutexGuard<()>,
    active: Arc<StdMutex<Option<ActiveSession>>>,
    started: Instant,
}

impl SessionGuard {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for SessionGuard {
    // Runs before `_guard` is released, so `current()` never reports a
    // session that has already ended.
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a maintenance session, or `None` if one is already running.
    /// Never waits.
    pub fn try_begin(&self) -> Option<SessionGuard> {
        self.begin(None)
    }

    /// Begin a sync session started by `trigger`, or `None` if one is already
    /// running. Never waits.
    pub fn try_begin_for(&self, trigger: RunTrigger) -> Option<SessionGuard> {
        self.begin(Some(trigger))
    }

    fn begin(&self, trigger: Option<RunTrigger>) -> Option<SessionGuard> {
        let guard = self.inner.clone().try_lock_owned().ok()?;
        let started = Instant::now();
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(ActiveSession {
            trigger,
            started,
        });
        Some(SessionGuard {
            _guard: guard,
            active: self.active.clone(),
            started,
        })
    }

    pub fn is_active(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// The running session, if any.
    pub fn current(&self) -> Option<ActiveSession> {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_session_is_rejected_until_first_ends() {
        let lock = SessionLock::new();
        let first = lock.try_begin().expect("first session");
        assert!(lock.is_active());
        assert!(lock.try_begin().is_none());

        drop(first);
        assert!(!lock.is_active());
        assert!(lock.try_begin().is_some());
    }

    #[test]
    fn clones_share_the_token() {
        let lock = SessionLock::new();
        let other = lock.clone();
        let _g = lock.try_begin().unwrap();
        assert!(other.try_begin().is_none());
    }

    #[test]
    fn current_reports_trigger_until_guard_drops() {
        let lock = SessionLock::new();
        assert!(lock.current().is_none());

        let guard = lock.try_begin_for(RunTrigger::FullRefresh).unwrap();
        let active = lock.clone().current().unwrap();
        assert!(active.elapsed() < Duration::from_secs(60));
        assert_eq!(active.trigger, Some(RunTrigger::FullRefresh));

        // A rejected attempt leaves the running session's record alone.
        assert!(lock.try_begin_for(RunTrigger::Poll).is_none());
        assert_eq!(lock.current().unwrap().trigger, Some(RunTrigger::FullRefresh));

        drop(guard);
        assert!(lock.current().is_none());

        let _maintenance = lock.try_begin().unwrap();
        assert_eq!(lock.current().unwrap().trigger, None);
    }
}
