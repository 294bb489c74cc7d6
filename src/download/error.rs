use thiserror::Error;

/// Typed download errors enabling retry classification.
///
/// `is_retryable()` separates transient failures (server errors, rate limits,
/// truncated transfers) from permanent ones (missing files, disk failures).
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error {status} downloading {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("HTTP error downloading {url} (bytes_so_far={bytes_written}): {source}")]
    Http {
        source: reqwest::Error,
        url: String,
        bytes_written: u64,
    },
}

impl DownloadError {
    /// A mismatch right after a transfer usually means the transfer was cut
    /// short, so it is retried like a transport error.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            DownloadError::ChecksumMismatch { .. } => true,
            DownloadError::Http { .. } => true,
            DownloadError::Disk(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> DownloadError {
        DownloadError::HttpStatus {
            status: code,
            url: "x".into(),
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!status(404).is_retryable());
        assert!(!status(403).is_retryable());
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
    }

    #[test]
    fn checksum_mismatch_retryable() {
        let e = DownloadError::ChecksumMismatch {
            filename: "a.jpg".into(),
            expected: "1".into(),
            actual: "2".into(),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn disk_not_retryable() {
        let e = DownloadError::Disk(std::io::Error::other("disk full"));
        assert!(!e.is_retryable());
    }

    #[tokio::test]
    async fn connection_error_retryable() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1")
            .send()
            .await
            .unwrap_err();
        let e = DownloadError::Http {
            source: err,
            url: "x".into(),
            bytes_written: 0,
        };
        assert!(e.is_retryable());
    }
}
