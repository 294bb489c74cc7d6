//! Typed signals from the engine to the display collaborator.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

/// What the display should be showing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum DisplayTarget {
    /// The remote slideshow page.
    Live(String),
    /// `index.html` of the published offline bundle.
    Bundle(PathBuf),
    /// Neutral loading page; nothing cached yet.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    CacheReady { index: PathBuf },
    MediaMissing { filenames: Vec<String> },
    StatusText { text: String },
    DownloadFailed { filename: String, reason: String },
    Serve { target: DisplayTarget },
}

/// Sending half handed to every component that emits display events.
///
/// Sends never block and never fail the sender: if the consumer has gone
/// away the event is dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DisplayEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DisplayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: DisplayEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Display event dropped, no consumer");
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(DisplayEvent::StatusText { text: text.into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = DisplayEvent::CacheReady {
            index: PathBuf::from("/data/current/index.html"),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "cache_ready", "index": "/data/current/index.html"})
        );

        let serve = DisplayEvent::Serve {
            target: DisplayTarget::Placeholder,
        };
        assert_eq!(
            serde_json::to_value(&serve).unwrap(),
            json!({"type": "serve", "target": {"kind": "placeholder"}})
        );
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.status("still fine");
    }

    #[tokio::test]
    async fn status_helper_emits_status_text() {
        let (sink, mut rx) = EventSink::channel();
        sink.status("Checking for updates");
        assert_eq!(
            rx.recv().await.unwrap(),
            DisplayEvent::StatusText {
                text: "Checking for updates".into()
            }
        );
    }
}
