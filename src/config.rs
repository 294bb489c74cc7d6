use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::cli::GlobalArgs;
use crate::engine::EngineConfig;
use crate::quota::GIB;
use crate::retry::RetryPolicy;
use crate::types::LogLevel;

/// File under the data directory that may hold the device name.
pub const DEVICE_NAME_FILE: &str = "device_name.txt";
const DB_FILE: &str = "kiosk-sync.db";
const LOCK_FILE: &str = "kiosk-sync.lock";
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Application configuration, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub base_url: Option<String>,
    pub device_id: Option<String>,
    pub media_base_url: Option<String>,
    pub slideshow_url: Option<String>,
    pub archiver: String,
    pub log_file: Option<PathBuf>,

    pub quota_bytes: u64,
    pub request_timeout: Duration,
    pub archive_timeout: Duration,
    pub retry: RetryPolicy,
    pub concurrency: usize,

    pub log_level: LogLevel,
    pub no_progress_bar: bool,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn trim_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

impl Config {
    pub fn from_cli(args: &GlobalArgs) -> anyhow::Result<Self> {
        if args.quota_gib == 0 {
            anyhow::bail!("--quota-gib must be at least 1");
        }
        let base_url = args.base_url.as_deref().map(trim_url);
        if let Some(url) = &base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("--base-url must be an http(s) URL, got '{url}'");
            }
        }

        Ok(Self {
            data_dir: expand_tilde(&args.data_dir),
            base_url,
            device_id: args.device_id.clone(),
            media_base_url: args.media_base_url.as_deref().map(trim_url),
            slideshow_url: args.slideshow_url.as_deref().map(|u| u.trim().to_string()),
            archiver: args.archiver.clone(),
            log_file: args.log_file.as_deref().map(expand_tilde),
            quota_bytes: args.quota_gib.saturating_mul(GIB),
            request_timeout: Duration::from_secs(args.request_timeout),
            archive_timeout: Duration::from_secs(args.archive_timeout),
            retry: RetryPolicy {
                max_retries: args.max_retries,
                base_delay: Duration::from_secs(args.retry_delay),
                max_delay: MAX_RETRY_DELAY,
            },
            concurrency: usize::from(args.concurrency),
            log_level: args.log_level,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    pub fn require_base_url(&self) -> anyhow::Result<&str> {
        self.base_url
            .as_deref()
            .context("--base-url (or KIOSK_BASE_URL) is required for this command")
    }

    /// Everything the engine needs. Resolves the device id and the derived
    /// URLs.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let base_url = self.require_base_url()?.to_string();
        let device_id = resolve_device_id(self.device_id.as_deref(), &self.data_dir)?;
        let media_base_url = self
            .media_base_url
            .clone()
            .unwrap_or_else(|| default_media_base_url(&base_url));
        let slideshow_url = self
            .slideshow_url
            .clone()
            .unwrap_or_else(|| default_slideshow_url(&base_url, &device_id));

        Ok(EngineConfig {
            base_url,
            device_id,
            media_base_url,
            slideshow_url,
            data_dir: self.data_dir.clone(),
            quota_bytes: self.quota_bytes,
            concurrency: self.concurrency,
            request_timeout: self.request_timeout,
            retry: self.retry,
            no_progress_bar: self.no_progress_bar,
        })
    }
}

pub fn default_media_base_url(base_url: &str) -> String {
    format!("{base_url}/webroot/files/Advertisements/images")
}

pub fn default_slideshow_url(base_url: &str, device_id: &str) -> String {
    format!(
        "{base_url}/panels/slideShowFullScreen/{}",
        urlencoding::encode(device_id)
    )
}

/// Device identity: the explicit flag, else `<data_dir>/device_name.txt`,
/// else the hostname. Surrounding whitespace is trimmed; blank values fall
/// through to the next source.
pub fn resolve_device_id(flag: Option<&str>, data_dir: &Path) -> anyhow::Result<String> {
    if let Some(id) = flag.map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }

    let file = data_dir.join(DEVICE_NAME_FILE);
    match std::fs::read_to_string(&file) {
        Ok(contents) => {
            let id = contents.trim();
            if !id.is_empty() {
                tracing::debug!(path = %file.display(), "Device id from file");
                return Ok(id.to_string());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", file.display()));
        }
    }

    let host = hostname::get().context("Failed to read hostname")?;
    let id = host.to_string_lossy().trim().to_string();
    if id.is_empty() {
        anyhow::bail!("No device id: pass --device-id or write {}", file.display());
    }
    tracing::debug!(device_id = %id, "Device id from hostname");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn global(args: &[&str]) -> GlobalArgs {
        crate::cli::Cli::try_parse_from(std::iter::once("kiosk-sync").chain(args.iter().copied()))
            .unwrap()
            .global
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Documents");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Documents"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde("relative/path"),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn from_cli_converts_units() {
        let cfg = Config::from_cli(&global(&[
            "--base-url",
            "http://server/",
            "--data-dir",
            "/var/lib/kiosk",
            "--quota-gib",
            "2",
            "--retry-delay",
            "3",
            "--max-retries",
            "4",
        ]))
        .unwrap();
        assert_eq!(cfg.base_url.as_deref(), Some("http://server"));
        assert_eq!(cfg.quota_bytes, 2 * GIB);
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(3));
        assert_eq!(cfg.retry.max_retries, 4);
        assert_eq!(cfg.db_path(), PathBuf::from("/var/lib/kiosk/kiosk-sync.db"));
        assert_eq!(cfg.lock_path(), PathBuf::from("/var/lib/kiosk/kiosk-sync.lock"));
    }

    #[test]
    fn from_cli_rejects_bad_values() {
        assert!(Config::from_cli(&global(&["--quota-gib", "0"])).is_err());
        assert!(Config::from_cli(&global(&["--base-url", "ftp://server"])).is_err());
    }

    #[test]
    fn engine_config_requires_base_url() {
        let mut args = global(&["--device-id", "d1"]);
        args.base_url = None;
        let cfg = Config::from_cli(&args).unwrap();
        assert!(cfg.engine_config().is_err());
    }

    #[test]
    fn engine_config_derives_urls() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_cli(&global(&[
            "--base-url",
            "https://ads.example.com",
            "--device-id",
            "lobby 1",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ]))
        .unwrap();
        let engine = cfg.engine_config().unwrap();
        assert_eq!(engine.device_id, "lobby 1");
        assert_eq!(
            engine.media_base_url,
            "https://ads.example.com/webroot/files/Advertisements/images"
        );
        assert_eq!(
            engine.slideshow_url,
            "https://ads.example.com/panels/slideShowFullScreen/lobby%201"
        );
        assert_eq!(engine.data_dir, dir.path());
    }

    #[test]
    fn explicit_urls_win() {
        let cfg = Config::from_cli(&global(&[
            "--base-url",
            "https://ads.example.com",
            "--device-id",
            "d",
            "--media-base-url",
            "https://cdn.example.com/media/",
            "--slideshow-url",
            "https://ads.example.com/show",
        ]))
        .unwrap();
        let engine = cfg.engine_config().unwrap();
        assert_eq!(engine.media_base_url, "https://cdn.example.com/media");
        assert_eq!(engine.slideshow_url, "https://ads.example.com/show");
    }

    #[test]
    fn device_id_flag_wins_and_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEVICE_NAME_FILE), "from-file\n").unwrap();
        assert_eq!(
            resolve_device_id(Some("  from-flag \n"), dir.path()).unwrap(),
            "from-flag"
        );
    }

    #[test]
    fn device_id_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEVICE_NAME_FILE), "  kiosk-lobby\n").unwrap();
        assert_eq!(resolve_device_id(None, dir.path()).unwrap(), "kiosk-lobby");
        assert_eq!(resolve_device_id(Some("   "), dir.path()).unwrap(), "kiosk-lobby");
    }

    #[test]
    fn device_id_falls_back_to_hostname() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEVICE_NAME_FILE), "\n").unwrap();
        let expected = hostname::get().unwrap().to_string_lossy().trim().to_string();
        if !expected.is_empty() {
            assert_eq!(resolve_device_id(None, dir.path()).unwrap(), expected);
        }
    }
}
