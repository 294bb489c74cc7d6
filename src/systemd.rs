//! sd_notify integration for running the daemon as a systemd service.
//!
//! Every method is a no-op when disabled or off Linux, so callers never need
//! `#[cfg]`.

#[derive(Debug, Clone, Copy)]
pub(crate) struct SystemdNotifier {
    enabled: bool,
}

#[derive(Debug, Clone, Copy)]
enum Notice<'a> {
    Ready,
    Stopping,
    Status(&'a str),
    Watchdog,
}

impl SystemdNotifier {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `READY=1`, sent once the coordinator has bootstrapped.
    pub(crate) fn notify_ready(&self) {
        self.send(Notice::Ready);
    }

    pub(crate) fn notify_stopping(&self) {
        self.send(Notice::Stopping);
    }

    /// `STATUS=<msg>`, mirroring the display status text.
    pub(crate) fn notify_status(&self, msg: &str) {
        self.send(Notice::Status(msg));
    }

    /// `WATCHDOG=1`, sent each time the coordinator handles a poll.
    pub(crate) fn notify_watchdog(&self) {
        self.send(Notice::Watchdog);
    }

    fn send(&self, notice: Notice<'_>) {
        if !self.enabled {
            return;
        }
        Self::send_impl(notice);
    }

    #[cfg(target_os = "linux")]
    fn send_impl(notice: Notice<'_>) {
        use sd_notify::NotifyState;

        let state = match notice {
            Notice::Ready => NotifyState::Ready,
            Notice::Stopping => NotifyState::Stopping,
            Notice::Status(msg) => NotifyState::Status(msg),
            Notice::Watchdog => NotifyState::Watchdog,
        };
        if let Err(e) = sd_notify::notify(false, &[state]) {
            tracing::debug!(error = %e, ?notice, "sd_notify failed");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn send_impl(_notice: Notice<'_>) {}
}
