use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;

use super::error::ManifestError;
use super::types::{Manifest, ManifestResponse, StatusResponse};

/// Client for the device-scoped playlist endpoints.
#[derive(Debug, Clone)]
pub struct ManifestClient {
    client: Client,
    base_url: String,
    device_id: String,
}

/// Build the shared HTTP client. Every request is bounded by `timeout`.
pub fn http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(concat!("kiosk-sync/", env!("CARGO_PKG_VERSION")))
        .build()
}

impl ManifestClient {
    pub fn new(client: Client, base_url: &str, device_id: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
        }
    }

    pub fn status_url(&self) -> String {
        format!("{}/status/{}", self.base_url, urlencoding::encode(&self.device_id))
    }

    pub fn manifest_url(&self) -> String {
        format!("{}/manifest/{}", self.base_url, urlencoding::encode(&self.device_id))
    }

    /// Current playlist version.
    pub async fn get_status(&self) -> Result<i64, ManifestError> {
        let status: StatusResponse = self.get_json(&self.status_url()).await?;
        tracing::debug!(modified_on = status.modified_on, "Fetched playlist status");
        Ok(status.modified_on)
    }

    /// Full manifest, stamped with the version from the status call that
    /// triggered the fetch.
    pub async fn get_manifest(&self, modified_on: i64) -> Result<Manifest, ManifestError> {
        let response: ManifestResponse = self.get_json(&self.manifest_url()).await?;
        let manifest = Manifest::from_response(modified_on, response);
        tracing::debug!(
            modified_on,
            ads = manifest.ads.len(),
            "Fetched manifest"
        );
        Ok(manifest)
    }

    /// Whether the server answers at all. Any HTTP response counts as
    /// reachable, including error statuses.
    pub async fn probe(&self) -> bool {
        match self.client.head(&self.base_url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Connectivity probe failed");
                false
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ManifestError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ManifestError::Transport {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ManifestError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| ManifestError::Transport {
                url: url.to_string(),
                source,
            })?;

        serde_json::from_slice(&body).map_err(|source| ManifestError::Body {
            url: url.to_string(),
            source,
        })
    }
}
