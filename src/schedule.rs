//! Periodic triggers for the coordinator.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::{Command, CoordinatorHandle};

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub poll_interval: Duration,
    /// `None` disables forced refreshes.
    pub full_refresh_interval: Option<Duration>,
}

impl Schedule {
    pub fn new(poll_secs: u64, full_refresh_secs: u64) -> Self {
        Self {
            poll_interval: Duration::from_secs(poll_secs.max(1)),
            full_refresh_interval: (full_refresh_secs > 0)
                .then(|| Duration::from_secs(full_refresh_secs)),
        }
    }
}

/// Spawn the poll and full-refresh tickers. Both stop on `shutdown` or when
/// the coordinator goes away. The first tick of each fires one interval
/// after start; the coordinator polls on its own at startup.
pub fn spawn(
    schedule: Schedule,
    handle: CoordinatorHandle,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![tokio::spawn(tick(
        schedule.poll_interval,
        Command::Poll,
        handle.clone(),
        shutdown.clone(),
    ))];
    if let Some(every) = schedule.full_refresh_interval {
        tasks.push(tokio::spawn(tick(every, Command::FullRefresh, handle, shutdown)));
    }
    tasks
}

async fn tick(
    every: Duration,
    command: Command,
    handle: CoordinatorHandle,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        tracing::trace!(?command, "Scheduled trigger");
        if !handle.send(command).await {
            break;
        }
    }
}
