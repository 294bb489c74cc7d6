use clap::{Args, Parser, Subcommand};

use crate::bundle::DEFAULT_ARCHIVER;
use crate::types::*;

#[derive(Parser, Debug)]
#[command(
    name = "kiosk-sync",
    about = "Keep a kiosk's slideshow media and offline bundle in sync"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Playlist server base URL (required for run, sync and verify)
    #[arg(long, env = "KIOSK_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Directory holding media, bundles and the state ledger
    #[arg(long, env = "KIOSK_DATA_DIR", default_value = "~/.kiosk-sync", global = true)]
    pub data_dir: String,

    /// Device identifier (default: <data-dir>/device_name.txt, then hostname)
    #[arg(long, env = "KIOSK_DEVICE_ID", global = true)]
    pub device_id: Option<String>,

    /// Base URL media filenames are appended to
    /// (default: <base-url>/webroot/files/Advertisements/images)
    #[arg(long, env = "KIOSK_MEDIA_BASE_URL", global = true)]
    pub media_base_url: Option<String>,

    /// Page shown while online and archived for offline use
    /// (default: <base-url>/panels/slideShowFullScreen/<device-id>)
    #[arg(long, env = "KIOSK_SLIDESHOW_URL", global = true)]
    pub slideshow_url: Option<String>,

    /// Disk quota for the media store, in GiB; exceeding it wipes the cache
    #[arg(long, env = "KIOSK_QUOTA_GIB", default_value_t = 10, global = true)]
    pub quota_gib: u64,

    /// Maximum concurrent verifications and downloads (1-32)
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..=32), global = true)]
    pub concurrency: u16,

    /// Timeout for each HTTP request, in seconds
    #[arg(long, default_value_t = 30, global = true)]
    pub request_timeout: u64,

    /// Retries per media download on transient errors (0 disables)
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(0..=100), global = true)]
    pub max_retries: u32,

    /// Base delay between retries, in seconds
    #[arg(long, default_value_t = 5, global = true)]
    pub retry_delay: u64,

    /// Archiver command template; {url} and {dest} are substituted
    #[arg(long, env = "KIOSK_ARCHIVER", default_value = DEFAULT_ARCHIVER, global = true)]
    pub archiver: String,

    /// Timeout for one archiver run, in seconds
    #[arg(long, default_value_t = 300, global = true)]
    pub archive_timeout: u64,

    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Also append logs to this file
    #[arg(long, env = "KIOSK_LOG_FILE", global = true)]
    pub log_file: Option<String>,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the sync daemon (default)
    Run(RunArgs),

    /// Run one forced sync session and exit
    Sync(SyncArgs),

    /// Fetch the manifest and check local media without downloading
    Verify,

    /// Show the state ledger summary
    Status(StatusArgs),

    /// Delete all cached media and bundles
    Evict(EvictArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Seconds between version polls
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval: u64,

    /// Seconds between forced full refreshes (0 disables)
    #[arg(long, default_value_t = 3600)]
    pub full_refresh_interval: u64,

    /// Where online/offline signals come from
    #[arg(long, value_enum, default_value = "probe")]
    pub connectivity: ConnectivitySource,

    /// Seconds between reachability probes
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub probe_interval: u64,

    /// Consecutive sessions with failed downloads before the cache is
    /// wiped and resynced (0 disables)
    #[arg(long, default_value_t = crate::engine::DEFAULT_FAILURE_THRESHOLD)]
    pub failure_threshold: u32,

    /// Write display events to stdout as JSON lines
    #[arg(long)]
    pub events_jsonl: bool,

    /// Send sd_notify messages (READY, STATUS, WATCHDOG, STOPPING)
    #[arg(long)]
    pub notify_systemd: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            poll_interval: 10,
            full_refresh_interval: 3600,
            connectivity: ConnectivitySource::Probe,
            probe_interval: 10,
            failure_threshold: crate::engine::DEFAULT_FAILURE_THRESHOLD,
            events_jsonl: false,
            notify_systemd: false,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Wipe media and bundles before syncing
    #[arg(long)]
    pub wipe: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// List failed assets
    #[arg(long)]
    pub failed: bool,

    /// List every asset in the ledger with its state and size
    #[arg(long)]
    pub assets: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EvictArgs {
    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

impl Cli {
    /// The subcommand to run; no subcommand means `run` with defaults.
    pub fn effective_command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Run(RunArgs::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("kiosk-sync").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn no_subcommand_defaults_to_run() {
        let cli = parse(&["--base-url", "http://x"]);
        match cli.effective_command() {
            Command::Run(args) => {
                assert_eq!(args.poll_interval, 10);
                assert_eq!(args.full_refresh_interval, 3600);
                assert_eq!(args.connectivity, ConnectivitySource::Probe);
                assert_eq!(args.failure_threshold, 3);
            }
            other => panic!("expected run, got {other:?}"),
        }
        assert_eq!(cli.global.base_url.as_deref(), Some("http://x"));
    }

    #[test]
    fn global_defaults() {
        let cli = parse(&["status"]);
        let g = &cli.global;
        assert_eq!(g.data_dir, "~/.kiosk-sync");
        assert_eq!(g.quota_gib, 10);
        assert_eq!(g.concurrency, 4);
        assert_eq!(g.request_timeout, 30);
        assert_eq!(g.max_retries, 2);
        assert_eq!(g.retry_delay, 5);
        assert_eq!(g.archiver, DEFAULT_ARCHIVER);
        assert_eq!(g.archive_timeout, 300);
        assert_eq!(g.log_level, LogLevel::Info);
        assert!(!g.no_progress_bar);
    }

    #[test]
    fn global_options_after_subcommand() {
        let cli = parse(&["sync", "--wipe", "--base-url", "http://x", "--concurrency", "8"]);
        assert!(matches!(cli.effective_command(), Command::Sync(SyncArgs { wipe: true })));
        assert_eq!(cli.global.concurrency, 8);
        assert_eq!(cli.global.base_url.as_deref(), Some("http://x"));
    }

    #[test]
    fn run_options() {
        let cli = parse(&[
            "run",
            "--poll-interval",
            "30",
            "--connectivity",
            "stdin",
            "--failure-threshold",
            "0",
            "--events-jsonl",
            "--notify-systemd",
        ]);
        let Command::Run(args) = cli.effective_command() else {
            panic!("expected run");
        };
        assert_eq!(args.poll_interval, 30);
        assert_eq!(args.connectivity, ConnectivitySource::Stdin);
        assert_eq!(args.failure_threshold, 0);
        assert!(args.events_jsonl);
        assert!(args.notify_systemd);
    }

    #[test]
    fn concurrency_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["kiosk-sync", "--concurrency", "0"]).is_err());
        assert!(Cli::try_parse_from(["kiosk-sync", "--concurrency", "33"]).is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        assert!(Cli::try_parse_from(["kiosk-sync", "run", "--poll-interval", "0"]).is_err());
    }

    #[test]
    fn evict_and_status_flags() {
        assert!(matches!(
            parse(&["evict", "--yes"]).effective_command(),
            Command::Evict(EvictArgs { yes: true })
        ));
        assert!(matches!(
            parse(&["status", "--failed"]).effective_command(),
            Command::Status(StatusArgs {
                failed: true,
                assets: false
            })
        ));
        assert!(matches!(
            parse(&["status", "--assets"]).effective_command(),
            Command::Status(StatusArgs { assets: true, .. })
        ));
        assert!(matches!(parse(&["verify"]).effective_command(), Command::Verify));
    }
}
