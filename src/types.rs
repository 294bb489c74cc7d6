use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Where online/offline signals come from in daemon mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConnectivitySource {
    /// Periodically probe the base URL and report changes.
    Probe,
    /// Read `online` / `offline` lines written by the display process.
    Stdin,
    /// Assume always online.
    None,
}

/// Kind of a media reference, used to pair markup references with assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a filename by extension. Unknown extensions are treated as images,
    /// since the manifest only declares image slots.
    pub fn from_filename(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" | "webm" | "ogv" | "mov" | "m4v" => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_from_extension() {
        assert_eq!(MediaKind::from_filename("clip.MP4"), MediaKind::Video);
        assert_eq!(MediaKind::from_filename("a.webm"), MediaKind::Video);
        assert_eq!(MediaKind::from_filename("poster.jpg"), MediaKind::Image);
        assert_eq!(MediaKind::from_filename("noext"), MediaKind::Image);
    }

    #[test]
    fn log_level_filter_strings() {
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }
}
