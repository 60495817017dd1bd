//! HTTP(S) download helper for disk images.

use std::path::Path;

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};

fn download_error(url: &str, reason: impl Into<String>) -> Error {
    Error::Download {
        url: url.to_string(),
        reason: reason.into(),
    }
}

/// Fetch `url` into `dest`, streaming the body to disk.
///
/// Transient network failures and non-success HTTP statuses surface as
/// download errors; partial files are left for the caller's cleanup.
pub async fn get(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    debug!(url = %url, dest = %dest.display(), "downloading");

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| download_error(url, e.to_string()))?;

    match response.status() {
        StatusCode::UNAUTHORIZED => return Err(download_error(url, "not authorized")),
        StatusCode::FORBIDDEN => return Err(download_error(url, "not allowed")),
        StatusCode::NOT_FOUND => return Err(download_error(url, "not found")),
        status if !status.is_success() => {
            return Err(download_error(url, format!("unexpected status {status}")))
        }
        _ => {}
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| download_error(url, e.to_string()))?;
        file.write_all(&chunk).await?;
    }

    file.flush().await?;

    Ok(())
}
