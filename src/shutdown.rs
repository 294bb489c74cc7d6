//! Graceful shutdown.
//!
//! SIGINT (Ctrl+C), SIGTERM and SIGHUP cancel a
//! [`tokio_util::sync::CancellationToken`]. The coordinator then lets the
//! running session finish before exiting. A second signal force-exits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::engine::SessionLock;

/// Install signal handlers and return the token they cancel. `sessions` is
/// the coordinator's lock, consulted to report what the shutdown waits on.
pub(crate) fn install_signal_handler(sessions: SessionLock) -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    #[cfg(unix)]
    let (mut sigterm, mut sighup) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::terminate())?,
            signal(SignalKind::hangup())?,
        )
    };

    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = sighup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Cannot listen for Ctrl+C");
                    return;
                }
            }

            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                log_first_signal(&sessions);
                handler_token.cancel();
            } else {
                match sessions.current().and_then(|s| s.trigger) {
                    Some(trigger) => tracing::warn!(
                        trigger = trigger.as_str(),
                        "Force exit requested, abandoning the running sync session"
                    ),
                    None => tracing::warn!("Force exit requested"),
                }
                std::process::exit(130);
            }
        }
    });

    Ok(token)
}

/// What the first signal waits for.
fn log_first_signal(sessions: &SessionLock) {
    match sessions.current() {
        Some(active) => tracing::info!(
            trigger = active.trigger.map_or("maintenance", |t| t.as_str()),
            running_secs = active.elapsed().as_secs(),
            "{}",
            waiting_message(active.trigger.map(|t| t.as_str()))
        ),
        None => tracing::info!("Received shutdown signal, no sync session running"),
    }
    tracing::info!("Send the signal again to force exit");
}

fn waiting_message(trigger: Option<&str>) -> String {
    match trigger {
        Some(trigger) => format!(
            "Received shutdown signal, waiting for the {trigger} sync session to finish..."
        ),
        None => "Received shutdown signal, waiting for the running maintenance session...".into(),
    }
}
