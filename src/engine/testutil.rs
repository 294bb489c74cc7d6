//! Fixtures shared by the engine tests: a wiremock playlist server, a fake
//! archiver and an engine wired to a temp data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::sync::{EngineConfig, SyncEngine};
use crate::bundle::{ArchiveError, PageArchiver};
use crate::events::{DisplayEvent, EventSink};
use crate::retry::RetryPolicy;
use crate::state::SqliteStateDb;

pub(crate) const DEVICE: &str = "kiosk-1";

pub(crate) fn content_of(name: &str) -> Vec<u8> {
    format!("content of {name}").into_bytes()
}

/// Playlist server with one ad per pair of filenames.
pub(crate) struct Server {
    pub mock: MockServer,
    names: Vec<String>,
}

impl Server {
    pub async fn start(modified_on: i64, names: &[&str]) -> Self {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/status/{DEVICE}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "modifiedOn": modified_on.to_string()
            })))
            .mount(&mock)
            .await;

        let ads: Vec<serde_json::Value> = names
            .chunks(2)
            .map(|pair| {
                let sum = |n: &str| format!("{:x}", md5::compute(content_of(n)));
                let second = pair.get(1).copied();
                json!({
                    "first_image": pair[0],
                    "first_image_md5": sum(pair[0]),
                    "second_image": second,
                    "second_image_md5": second.map(|n| sum(n)),
                })
            })
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("/manifest/{DEVICE}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "group": {"playlist": {"advertisements": ads}}
            })))
            .mount(&mock)
            .await;

        Self {
            mock,
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// Serve every media file, expecting exactly `times` requests each.
    pub async fn expect_media(&self, times: u64) {
        for name in &self.names {
            Mock::given(method("GET"))
                .and(path(format!("/files/{name}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(content_of(name)))
                .expect(times)
                .mount(&self.mock)
                .await;
        }
    }

    pub async fn serve_media(&self, name: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/files/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(content_of(name)))
            .mount(&self.mock)
            .await;
    }

    pub async fn fail_media(&self, name: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(format!("/files/{name}")))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.mock)
            .await;
    }

    pub fn uri(&self) -> String {
        self.mock.uri()
    }
}

/// Writes a page with one `<img>` per filename, referenced by remote URL.
pub(crate) struct FakeArchiver {
    pub base: String,
    pub names: Vec<String>,
}

#[async_trait]
impl PageArchiver for FakeArchiver {
    async fn archive(&self, _url: &str, dest: &Path) -> Result<(), ArchiveError> {
        let body: String = self
            .names
            .iter()
            .map(|n| format!(r#"<img src="{}/files/{n}">"#, self.base))
            .collect();
        std::fs::create_dir_all(dest).unwrap();
        std::fs::write(dest.join("index.html"), format!("<html>{body}</html>")).unwrap();
        Ok(())
    }
}

pub(crate) struct Harness {
    pub dir: tempfile::TempDir,
    pub engine: Arc<SyncEngine>,
    pub events: mpsc::UnboundedReceiver<DisplayEvent>,
}

impl Harness {
    pub async fn new(server: &Server, quota_bytes: u64) -> Self {
        Self::with_base(&server.uri(), server.names.clone(), quota_bytes)
    }

    /// Engine pointed at a port nothing listens on.
    pub async fn unreachable() -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Self::with_base(&format!("http://127.0.0.1:{port}"), Vec::new(), u64::MAX)
    }

    fn with_base(base: &str, names: Vec<String>, quota_bytes: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            base_url: base.to_string(),
            device_id: DEVICE.to_string(),
            media_base_url: format!("{base}/files"),
            slideshow_url: format!("{base}/panels/slideShowFullScreen/{DEVICE}"),
            data_dir: dir.path().to_path_buf(),
            quota_bytes,
            concurrency: 2,
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy::none(),
            no_progress_bar: true,
        };
        let (sink, events) = EventSink::channel();
        let archiver = Arc::new(FakeArchiver {
            base: base.to_string(),
            names,
        });
        let ledger = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let engine = SyncEngine::new(&config, archiver, ledger, sink).unwrap();
        Self {
            dir,
            engine: Arc::new(engine),
            events,
        }
    }

    pub fn media_dir(&self) -> PathBuf {
        self.dir.path().join("media")
    }

    pub fn drain_events(&mut self) -> Vec<DisplayEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
