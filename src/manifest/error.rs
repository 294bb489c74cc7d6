use thiserror::Error;

/// Why a manifest or status request failed.
///
/// Every variant means the same thing to the coordinator: the remote state is
/// unknown right now and the decision must be deferred.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Malformed response from {url}: {source}")]
    Body {
        url: String,
        source: serde_json::Error,
    },
}
