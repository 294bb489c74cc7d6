//! Sources of online/offline signals for the coordinator.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::{Command, Connectivity, CoordinatorHandle, SyncEngine};
use crate::types::ConnectivitySource;

/// Parse one line written by the display collaborator.
pub fn parse_signal(line: &str) -> Option<Connectivity> {
    match line.trim().to_ascii_lowercase().as_str() {
        "online" => Some(Connectivity::Online),
        "offline" => Some(Connectivity::Offline),
        _ => None,
    }
}

/// Turns a stream of probe results into change notifications.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last: Option<bool>,
}

impl ChangeDetector {
    /// The signal to send for this observation, or `None` if nothing changed.
    pub fn observe(&mut self, reachable: bool) -> Option<Connectivity> {
        if self.last == Some(reachable) {
            return None;
        }
        self.last = Some(reachable);
        Some(if reachable {
            Connectivity::Online
        } else {
            Connectivity::Offline
        })
    }
}

/// Start the configured source. `None` spawns nothing.
pub fn spawn(
    source: ConnectivitySource,
    engine: Arc<SyncEngine>,
    probe_interval: Duration,
    handle: CoordinatorHandle,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    match source {
        ConnectivitySource::Probe => Some(tokio::spawn(probe_loop(
            engine,
            probe_interval,
            handle,
            shutdown,
        ))),
        ConnectivitySource::Stdin => {
            let reader = tokio::io::BufReader::new(tokio::io::stdin());
            Some(tokio::spawn(read_signals(reader, handle, shutdown)))
        }
        ConnectivitySource::None => None,
    }
}

async fn probe_loop(
    engine: Arc<SyncEngine>,
    every: Duration,
    handle: CoordinatorHandle,
    shutdown: CancellationToken,
) {
    let mut detector = ChangeDetector::default();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let reachable = engine.probe().await;
        if let Some(signal) = detector.observe(reachable) {
            tracing::info!(?signal, "Connectivity changed");
            if !handle.send(Command::Connectivity(signal)).await {
                break;
            }
        }
    }
}

/// Forward `online` / `offline` lines until EOF or shutdown. Other lines are
/// ignored.
pub async fn read_signals<R>(reader: R, handle: CoordinatorHandle, shutdown: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => match parse_signal(&line) {
                Some(signal) => {
                    tracing::debug!(?signal, "Connectivity signal");
                    if !handle.send(Command::Connectivity(signal)).await {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => tracing::debug!(line = %line, "Ignoring unknown connectivity line"),
            },
            Ok(None) => {
                tracing::debug!("Connectivity input closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read connectivity input");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signals_case_insensitively() {
        assert_eq!(parse_signal("online"), Some(Connectivity::Online));
        assert_eq!(parse_signal("  OFFLINE\r"), Some(Connectivity::Offline));
        assert_eq!(parse_signal("maybe"), None);
        assert_eq!(parse_signal(""), None);
    }

    #[test]
    fn detector_reports_only_changes() {
        let mut d = ChangeDetector::default();
        assert_eq!(d.observe(true), Some(Connectivity::Online));
        assert_eq!(d.observe(true), None);
        assert_eq!(d.observe(false), Some(Connectivity::Offline));
        assert_eq!(d.observe(false), None);
        assert_eq!(d.observe(true), Some(Connectivity::Online));
    }

    #[tokio::test]
    async fn reader_forwards_known_lines_until_eof() {
        let input: &[u8] = b"offline\nnoise\n\nonline\n";
        let (handle, mut rx) = CoordinatorHandle::channel_for_test();
        read_signals(input, handle, CancellationToken::new()).await;

        assert_eq!(
            rx.recv().await,
            Some(Command::Connectivity(Connectivity::Offline))
        );
        assert_eq!(
            rx.recv().await,
            Some(Command::Connectivity(Connectivity::Online))
        );
        assert_eq!(rx.recv().await, None);
    }
}
