//! The coordinating loop.
//!
//! Owns [`EngineState`], turns triggers and connectivity signals into
//! sessions, applies the recovery policy to their reports and tells the
//! display what to show. Sessions run on their own task; the loop never
//! blocks on one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::SyncError;
use super::recovery::{self, RecoveryAction};
use super::session::{SessionGuard, SessionLock};
use super::state::{AppliedVersion, Connectivity, EngineState, PhaseEvent, SyncPhase};
use super::sync::{SessionPlan, SessionReport, SyncEngine};
use crate::events::{DisplayEvent, DisplayTarget};
use crate::state::RunTrigger;
use crate::systemd::SystemdNotifier;

const COMMAND_BUFFER: usize = 32;

/// Inputs to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Check the remote version and sync if it moved.
    Poll,
    /// Sync regardless of version.
    FullRefresh,
    Connectivity(Connectivity),
    /// Stop once the running session (if any) has finished.
    Shutdown,
}

/// Cloneable sender side of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Returns false once the coordinator has stopped.
    pub async fn send(&self, command: Command) -> bool {
        self.tx.send(command).await.is_ok()
    }

    #[cfg(test)]
    pub(crate) fn channel_for_test() -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        (Self { tx }, rx)
    }
}

enum SessionMessage {
    Phase(PhaseEvent),
    /// The guard travels back so the session counts as running until its
    /// report has been applied.
    Finished(Box<SessionReport>, SessionGuard),
}

pub struct SyncCoordinator {
    engine: Arc<SyncEngine>,
    state: EngineState,
    lock: SessionLock,
    failure_threshold: u32,
    commands: mpsc::Receiver<Command>,
    session_tx: mpsc::UnboundedSender<SessionMessage>,
    session_rx: mpsc::UnboundedReceiver<SessionMessage>,
    shutdown: CancellationToken,
    watchdog: SystemdNotifier,
    /// Polls handled so far; each one fed the watchdog.
    heartbeats: u64,
}

impl SyncCoordinator {
    pub fn new(
        engine: Arc<SyncEngine>,
        lock: SessionLock,
        failure_threshold: u32,
        shutdown: CancellationToken,
    ) -> (Self, CoordinatorHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            engine,
            state: EngineState::default(),
            lock,
            failure_threshold,
            commands,
            session_tx,
            session_rx,
            shutdown,
            watchdog: SystemdNotifier::new(false),
            heartbeats: 0,
        };
        (coordinator, CoordinatorHandle { tx })
    }

    /// Feed `notifier`'s watchdog each time a poll has been handled, so a
    /// stalled loop stops the heartbeat.
    pub(crate) fn set_watchdog(&mut self, notifier: SystemdNotifier) {
        self.watchdog = notifier;
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Restore state from disk and the ledger, and show whatever is cached.
    pub async fn bootstrap(&mut self) {
        self.state.bundle_published = self.engine.layout().is_published();
        self.state.applied_version = self.engine.restore_applied_version().await;
        self.state.failure_streak = match self.engine.ledger().failure_streak().await {
            Ok(streak) => streak,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read failure streak");
                0
            }
        };
        tracing::info!(
            bundle_published = self.state.bundle_published,
            applied = ?self.state.applied_version.as_option(),
            failure_streak = self.state.failure_streak,
            "Engine bootstrapped"
        );
        self.set_status("Starting");
        let cached = self.cached_target();
        self.serve(cached);
        self.state.apply(PhaseEvent::Bootstrapped);
    }

    /// Run until shutdown. Starts with an immediate poll.
    pub async fn run(mut self) -> EngineState {
        if self.state.phase == SyncPhase::Bootstrapping {
            self.bootstrap().await;
        }
        self.start_session(RunTrigger::Poll);

        let mut stopping = false;
        loop {
            if stopping && !self.lock.is_active() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled(), if !stopping => {
                    tracing::info!("Coordinator stopping");
                    stopping = true;
                }
                command = self.commands.recv(), if !stopping => match command {
                    Some(Command::Shutdown) | None => stopping = true,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = self.session_rx.recv() => match message {
                    SessionMessage::Phase(event) => {
                        self.state.apply(event);
                    }
                    SessionMessage::Finished(report, guard) => {
                        self.finish_session(*report).await;
                        drop(guard);
                    }
                },
            }
        }
        self.state
    }

    fn handle_command(&mut self, command: Command) {
        if command == Command::Poll {
            self.heartbeats += 1;
            self.watchdog.notify_watchdog();
        }
        match command {
            Command::Poll | Command::FullRefresh if self.state.is_offline() => {
                tracing::debug!(?command, "Offline, trigger skipped");
            }
            Command::Poll => {
                self.start_session(RunTrigger::Poll);
            }
            Command::FullRefresh => {
                self.start_session(RunTrigger::FullRefresh);
            }
            Command::Connectivity(Connectivity::Offline) => {
                if !self.state.is_offline() {
                    tracing::info!("Connectivity lost, serving cached content");
                }
                self.state.connectivity = Connectivity::Offline;
                let cached = self.cached_target();
                self.serve(cached);
            }
            Command::Connectivity(connectivity) => {
                let was_offline = self.state.is_offline();
                self.state.connectivity = connectivity;
                if was_offline {
                    tracing::info!("Connectivity restored");
                }
                if !self.lock.is_active() {
                    self.state.phase = SyncPhase::CheckingConnectivity;
                }
                self.start_session(RunTrigger::Poll);
            }
            Command::Shutdown => {}
        }
    }

    /// Spawn a session unless one is already running. Returns whether one
    /// was started.
    fn start_session(&mut self, trigger: RunTrigger) -> bool {
        let effective = if self.state.pending_wipe {
            RunTrigger::Resync
        } else {
            trigger
        };
        let Some(guard) = self.lock.try_begin_for(effective) else {
            tracing::info!(trigger = trigger.as_str(), "Session in progress, trigger coalesced");
            return false;
        };
        let plan = SessionPlan {
            trigger: effective,
            applied: self.state.applied_version,
            wipe: self.state.pending_wipe,
        };
        self.state.pending_wipe = false;

        let engine = self.engine.clone();
        let tx = self.session_tx.clone();
        tokio::spawn(async move {
            let phases = tx.clone();
            let progress = move |event| {
                let _ = phases.send(SessionMessage::Phase(event));
            };
            let report = engine.run_session(&guard, plan, &progress).await;
            let _ = tx.send(SessionMessage::Finished(Box::new(report), guard));
        });
        true
    }

    async fn finish_session(&mut self, report: SessionReport) {
        self.state.applied_version = report.applied;
        self.state.bundle_published = self.engine.layout().is_published();

        let streak = recovery::next_streak(&report, self.state.failure_streak);
        self.state.failure_streak = streak;
        match recovery::decide(&report, streak, self.failure_threshold) {
            RecoveryAction::WipeAndResync => {
                tracing::warn!(
                    failure_streak = streak,
                    error = ?report.error.as_ref().map(|e| e.to_string()),
                    "Cache will be wiped and resynced"
                );
                self.state.pending_wipe = true;
                self.state.failure_streak = 0;
                self.state.applied_version = AppliedVersion::Unknown;
                if let Err(e) = self.engine.ledger().set_applied_version(None).await {
                    tracing::warn!(error = %e, "Failed to reset applied version");
                }
            }
            RecoveryAction::Defer => {
                tracing::info!("Deferring until the next trigger");
            }
            RecoveryAction::None => {}
        }
        if let Err(e) = self
            .engine
            .ledger()
            .set_failure_streak(self.state.failure_streak)
            .await
        {
            tracing::warn!(error = %e, "Failed to persist failure streak");
        }

        if self.state.is_offline() {
            let cached = self.cached_target();
            self.serve(cached);
            return;
        }
        match &report.error {
            Some(SyncError::NetworkUnavailable(_)) => {
                self.set_status("Server unreachable, showing saved slideshow");
                let cached = self.cached_target();
                self.serve(cached);
            }
            Some(SyncError::QuotaExceeded { .. }) => {
                if matches!(self.state.serving, Some(DisplayTarget::Bundle(_))) {
                    let cached = self.cached_target();
                    self.serve(cached);
                }
            }
            _ => {
                let live = DisplayTarget::Live(self.engine.slideshow_url().to_string());
                self.serve(live);
            }
        }
    }

    fn cached_target(&self) -> DisplayTarget {
        self.state
            .cached_target(&self.engine.layout().current_index())
    }

    /// Tell the display what to show, if it changed.
    fn serve(&mut self, target: DisplayTarget) {
        if self.state.serving.as_ref() == Some(&target) {
            return;
        }
        tracing::info!(?target, "Display target");
        self.state.serving = Some(target.clone());
        self.engine.events().emit(DisplayEvent::Serve { target });
    }

    fn set_status(&mut self, text: &str) {
        self.state.status_text = text.to_string();
        self.engine.events().status(text);
    }
}
