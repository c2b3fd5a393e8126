//! Artifact download

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::FleetError;
use crate::http::client::status_error;

/// Downloads an artifact to a local file
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Write the artifact at `url` to `dest`; returns the bytes written
    async fn fetch(&self, url: &str, dest: &Path, timeout: Duration) -> Result<u64, FleetError>;
}

/// Streams artifacts over HTTP(S)
#[derive(Debug, Clone, Default)]
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, FleetError> {
        let response = self.client.get(url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, url));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &str, dest: &Path, timeout: Duration) -> Result<u64, FleetError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| FleetError::InvalidInput(format!("invalid artifact url {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FleetError::InvalidInput(format!(
                "unsupported artifact url scheme: {}",
                parsed.scheme()
            )));
        }

        debug!(url = %url, dest = %dest.display(), "Downloading artifact");
        match tokio::time::timeout(timeout, self.download(url, dest)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::Transient(format!(
                "download of {} timed out after {:?}",
                url, timeout
            ))),
        }
    }
}

/// Network failures are retryable; anything else is not
fn classify(e: reqwest::Error) -> FleetError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        return FleetError::Transient(e.to_string());
    }
    match e.status() {
        Some(status) => classify_status(status, e.url().map(|u| u.as_str()).unwrap_or("")),
        None => FleetError::HttpError(e),
    }
}

fn classify_status(status: StatusCode, url: &str) -> FleetError {
    status_error(status, &format!("artifact {}", url))
}
