//! kiosk-sync: media synchronization and offline cache engine for kiosk
//! slideshow displays.
//!
//! Polls a playlist server for manifest changes, keeps an MD5-verified local
//! copy of every referenced image and video, and publishes a self-contained
//! offline bundle of the slideshow page whose media references point at the
//! local copies. The display is told what to show (live page, offline bundle
//! or placeholder) through typed events.

#![warn(clippy::all)]

mod bundle;
mod cli;
mod config;
mod connectivity;
mod download;
mod engine;
mod events;
mod manifest;
mod media;
mod quota;
pub mod retry;
mod schedule;
mod shutdown;
mod state;
mod systemd;
mod types;
mod verify;

use std::io::Write as _;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use fs4::fs_std::FileExt;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::Config;
use engine::{SessionLock, SyncCoordinator, SyncEngine};
use events::{DisplayEvent, EventSink};
use state::StateDb;
use systemd::SystemdNotifier;
use types::ConnectivitySource;

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    let file_layer = match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    // stdout is reserved for command output and JSONL events.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

/// Take the advisory lock that keeps a second process off this data
/// directory. Held until the returned file is dropped.
async fn acquire_data_lock(config: &Config) -> anyhow::Result<std::fs::File> {
    let data_dir = config.data_dir.clone();
    let lock_path = config.lock_path();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        let file = std::fs::File::create(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another kiosk-sync instance is using this data directory (lock: {})",
                lock_path.display()
            )
        })?;
        Ok::<std::fs::File, anyhow::Error>(file)
    })
    .await?
}

async fn open_ledger(config: &Config) -> anyhow::Result<Arc<state::SqliteStateDb>> {
    let db_path = config.db_path();
    let db = state::SqliteStateDb::open(&db_path)
        .await
        .with_context(|| format!("Failed to open state ledger at {}", db_path.display()))?;
    tracing::debug!("State ledger opened at {}", db_path.display());
    Ok(Arc::new(db))
}

async fn build_engine(config: &Config, events: EventSink) -> anyhow::Result<Arc<SyncEngine>> {
    let engine_config = config.engine_config()?;
    let archiver = bundle::CommandArchiver::from_template(&config.archiver, config.archive_timeout)
        .context("Invalid --archiver template")?;
    let ledger = open_ledger(config).await?;
    let engine = SyncEngine::new(&engine_config, Arc::new(archiver), ledger, events)
        .context("Failed to initialise sync engine")?;
    tracing::info!(
        device_id = %engine_config.device_id,
        base_url = %engine_config.base_url,
        data_dir = %engine_config.data_dir.display(),
        quota_bytes = engine.quota().limit_bytes(),
        "Engine ready"
    );
    Ok(Arc::new(engine))
}

/// Drain display events: log each, optionally print it as a JSON line, and
/// mirror status text to systemd. Ends when every sender is gone.
fn spawn_event_sink(
    mut rx: mpsc::UnboundedReceiver<DisplayEvent>,
    jsonl: bool,
    systemd: SystemdNotifier,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match &event {
                DisplayEvent::StatusText { text } => {
                    tracing::info!(status = %text, "Display status");
                    systemd.notify_status(text);
                }
                DisplayEvent::DownloadFailed { filename, reason } => {
                    tracing::warn!(%filename, %reason, "Display: download failed");
                }
                DisplayEvent::MediaMissing { filenames } => {
                    tracing::warn!(count = filenames.len(), "Display: media missing");
                }
                other => tracing::info!(event = ?other, "Display event"),
            }
            if jsonl {
                match serde_json::to_string(&event) {
                    Ok(line) => {
                        let mut stdout = std::io::stdout().lock();
                        if writeln!(stdout, "{line}").and_then(|()| stdout.flush()).is_err() {
                            tracing::debug!("stdout closed, event dropped");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialise display event"),
                }
            }
        }
    })
}

/// Run the daemon until a shutdown signal.
async fn run_daemon(config: &Config, args: cli::RunArgs) -> anyhow::Result<()> {
    let _data_lock = acquire_data_lock(config).await?;
    let systemd = SystemdNotifier::new(args.notify_systemd);
    let sessions = SessionLock::new();
    let shutdown = shutdown::install_signal_handler(sessions.clone())
        .context("Failed to install signal handlers")?;

    let (sink, rx) = EventSink::channel();
    let events_task = spawn_event_sink(rx, args.events_jsonl, systemd);
    let engine = build_engine(config, sink).await?;

    let (mut coordinator, handle) = SyncCoordinator::new(
        engine.clone(),
        sessions,
        args.failure_threshold,
        shutdown.clone(),
    );
    coordinator.set_watchdog(systemd);
    coordinator.bootstrap().await;
    let initial = coordinator.state();
    tracing::info!(
        bundle_published = initial.bundle_published,
        applied = ?initial.applied_version.as_option(),
        "Serving cached content until the first sync"
    );
    systemd.notify_ready();

    let tickers = schedule::spawn(
        schedule::Schedule::new(args.poll_interval, args.full_refresh_interval),
        handle.clone(),
        shutdown.clone(),
    );
    let monitor = connectivity::spawn(
        args.connectivity,
        engine.clone(),
        std::time::Duration::from_secs(args.probe_interval),
        handle,
        shutdown.clone(),
    );
    tracing::info!(
        poll_interval = args.poll_interval,
        full_refresh_interval = args.full_refresh_interval,
        connectivity = ?args.connectivity,
        "Running"
    );

    let final_state = coordinator.run().await;
    systemd.notify_stopping();
    shutdown.cancel();

    for ticker in tickers {
        if let Err(e) = ticker.await {
            tracing::debug!(error = %e, "Scheduler task ended abnormally");
        }
    }
    if let Some(monitor) = monitor {
        monitor.abort();
    }
    drop(engine);
    if tokio::time::timeout(std::time::Duration::from_secs(5), events_task)
        .await
        .is_err()
    {
        tracing::debug!("Event sink still busy at exit");
    }

    tracing::info!(
        phase = final_state.phase.as_str(),
        applied = ?final_state.applied_version.as_option(),
        "Stopped"
    );
    if args.connectivity == ConnectivitySource::Stdin {
        // A pending stdin read cannot be interrupted and would hold the runtime open.
        std::process::exit(0);
    }
    Ok(())
}

/// Run the sync command: one forced session.
async fn run_sync(config: &Config, args: cli::SyncArgs) -> anyhow::Result<()> {
    let _data_lock = acquire_data_lock(config).await?;
    let (sink, rx) = EventSink::channel();
    let events_task = spawn_event_sink(rx, false, SystemdNotifier::new(false));
    let engine = build_engine(config, sink).await?;

    let lock = SessionLock::new();
    let trigger = if args.wipe {
        state::RunTrigger::Resync
    } else {
        state::RunTrigger::Manual
    };
    let guard = lock
        .try_begin_for(trigger)
        .context("A sync session is already running")?;
    let report = engine.sync_once(&guard, args.wipe).await;
    drop(guard);
    drop(engine);
    let _ = events_task.await;

    println!();
    println!("Sync {}:", report.outcome());
    if let Some(version) = report.modified_on {
        println!("  Manifest version: {}", version);
    }
    if report.wiped {
        println!("  Cache wiped first");
    }
    println!("  Assets:     {}", report.assets_seen);
    println!("  Downloaded: {} ({} bytes)", report.downloaded, report.bytes);
    println!("  Failed:     {}", report.failed.len());
    for filename in &report.failed {
        println!("    {}", filename);
    }
    if let Some(bundle) = &report.published {
        println!(
            "  Published bundle {} ({} references rewritten, {} placeholders)",
            bundle.generation, bundle.rewritten, bundle.placeholders
        );
        println!("  Index: {}", bundle.index.display());
    }
    println!("  Elapsed:    {:.1}s", report.elapsed.as_secs_f64());
    if let Some(e) = &report.error {
        println!("  Error:      {}", e);
    }

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Run the verify command.
async fn run_verify(config: &Config) -> anyhow::Result<()> {
    let (sink, _rx) = EventSink::channel();
    let engine = build_engine(config, sink).await?;
    let report = engine
        .verify_only()
        .await
        .context("Failed to fetch the manifest")?;

    println!("Verifying {} manifest assets...", report.assets.len());
    println!();
    for asset in &report.assets {
        println!("{:<10} {}", asset.state().as_str().to_uppercase(), asset.filename);
    }

    let valid = report.count(media::AssetState::Valid);
    let missing = report.count(media::AssetState::Missing);
    let mismatched = report.count(media::AssetState::Mismatched);
    println!();
    println!("Results:");
    println!("  Valid:      {}", valid);
    println!("  Missing:    {}", missing);
    println!("  Mismatched: {}", mismatched);

    if valid < report.assets.len() {
        std::process::exit(1);
    }
    Ok(())
}

/// Run the status command. Reads only local state.
async fn run_status(config: &Config, args: cli::StatusArgs) -> anyhow::Result<()> {
    let db_path = config.db_path();
    if !db_path.exists() {
        println!("No state ledger found at {}", db_path.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let db = state::SqliteStateDb::open(&db_path).await?;
    let summary = db.get_summary().await?;
    let layout = bundle::BundleLayout::new(&config.data_dir);
    let media_dir = config.data_dir.join("media");
    let usage = tokio::task::spawn_blocking(move || quota::measure(&media_dir)).await??;

    println!("State ledger: {}", db_path.display());
    println!();
    match summary.applied_version {
        Some(version) => println!("Applied version:  {}", version),
        None => println!("Applied version:  none"),
    }
    match layout.current_generation() {
        Some(generation) => println!("Published bundle: {}", generation),
        None => println!("Published bundle: none"),
    }
    println!(
        "Media usage:      {:.2} GiB of {:.2} GiB",
        usage as f64 / quota::GIB as f64,
        config.quota_bytes as f64 / quota::GIB as f64
    );
    println!("Failure streak:   {}", summary.failure_streak);
    println!();
    println!("Assets:");
    println!("  Total:  {}", summary.total_assets);
    println!("  Valid:  {}", summary.valid);
    println!("  Failed: {}", summary.failed);
    println!("  Other:  {}", summary.other());
    println!();

    if let Some(started) = &summary.last_sync_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!(
            "Last sync completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(outcome) = &summary.last_outcome {
        println!("Last outcome:        {}", outcome);
    }

    if args.assets && summary.total_assets > 0 {
        println!();
        println!("Ledger assets:");
        for asset in db.get_assets().await? {
            let size = asset
                .size_bytes
                .map(|b| format!("{b} B"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<10} {:>12}  {}",
                asset.state.as_str().to_uppercase(),
                size,
                asset.filename
            );
        }
    }

    if args.failed && summary.failed > 0 {
        println!();
        println!("Failed assets:");
        for asset in db.get_failed().await? {
            println!(
                "  {} - {}",
                asset.filename,
                asset.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

/// Run the evict command: delete every cached file regardless of quota.
async fn run_evict(config: &Config, args: cli::EvictArgs) -> anyhow::Result<()> {
    if !args.yes {
        println!("This will delete all cached media and offline bundles under:");
        println!("  {}", config.data_dir.display());
        println!();
        print!("Are you sure? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let _data_lock = acquire_data_lock(config).await?;
    let store = media::MediaStore::open(config.data_dir.join("media"))?;
    let layout = bundle::BundleLayout::new(&config.data_dir);
    let quota = quota::QuotaManager::new(store, layout, config.quota_bytes);
    let freed = quota.usage().await?;

    let lock = SessionLock::new();
    let guard = lock.try_begin().context("A sync session is already running")?;
    quota.evict_all(&guard).await?;
    drop(guard);

    let db = open_ledger(config).await?;
    let forgotten = db.clear_assets().await?;
    db.set_applied_version(None).await?;
    db.set_failure_streak(0).await?;

    println!(
        "Evicted {:.2} GiB; {} ledger entries cleared. The next sync downloads everything.",
        freed as f64 / quota::GIB as f64,
        forgotten
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let config = Config::from_cli(&cli.global)?;
    init_logging(&config)?;

    match cli.effective_command() {
        Command::Run(args) => run_daemon(&config, args).await,
        Command::Sync(args) => run_sync(&config, args).await,
        Command::Verify => run_verify(&config).await,
        Command::Status(args) => run_status(&config, args).await,
        Command::Evict(args) => run_evict(&config, args).await,
    }
}
