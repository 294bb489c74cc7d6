use std::path::Path;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use crate::retry::{self, RetryPolicy};

/// Download `url` into `dest` through the temporary `part_path`.
///
/// Every attempt starts from an empty `.part` file and hashes the body as it
/// streams. Only a body whose MD5 matches `expected_md5` (or any body when no
/// checksum was declared) is renamed over `dest`, so readers of `dest` never
/// see a partial or wrong file. Returns the number of bytes written.
pub async fn download_file(
    client: &Client,
    url: &str,
    dest: &Path,
    part_path: &Path,
    expected_md5: &str,
    policy: &RetryPolicy,
) -> Result<u64, DownloadError> {
    let result = retry::retry_transient(policy, DownloadError::is_retryable, || async {
        let _ = fs::remove_file(part_path).await;
        attempt_download(client, url, dest, part_path, expected_md5).await
    })
    .await;

    if result.is_err() {
        let _ = fs::remove_file(part_path).await;
    }
    result
}

async fn attempt_download(
    client: &Client,
    url: &str,
    dest: &Path,
    part_path: &Path,
    expected_md5: &str,
) -> Result<u64, DownloadError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| DownloadError::Http {
            source,
            url: url.to_string(),
            bytes_written: 0,
        })?;

    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part_path)
        .await?;

    let mut context = md5::Context::new();
    let mut bytes_written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| DownloadError::Http {
            source,
            url: url.to_string(),
            bytes_written,
        })?;
        context.consume(&chunk);
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    let actual = format!("{:x}", context.compute());
    if !expected_md5.is_empty() && !actual.eq_ignore_ascii_case(expected_md5) {
        let _ = fs::remove_file(part_path).await;
        return Err(DownloadError::ChecksumMismatch {
            filename: dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            expected: expected_md5.to_string(),
            actual,
        });
    }

    fs::rename(part_path, dest).await?;
    Ok(bytes_written)
}
