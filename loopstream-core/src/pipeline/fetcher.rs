use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::catalog::LoopRecord;
use crate::config::DownloadSection;

use super::error::{PipelineError, PipelineResult};
use super::types::{partition_outcomes, DownloadedClip, ItemOutcome, SkippedItem, Stage};
use super::workspace::ScratchWorkspace;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("transfer stalled for {0:?}")]
    Stalled(Duration),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        FetchError::Network(error.to_string())
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Client for clip transfers: bounded connect, no total deadline unless
/// one is configured.
pub fn build_download_client(section: &DownloadSection) -> FetchResult<Client> {
    let mut builder = Client::builder()
        .user_agent(concat!("loopstream/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(section.connect_timeout());
    if let Some(total) = section.total_timeout() {
        builder = builder.timeout(total);
    }
    Ok(builder.build()?)
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    stall_timeout: Option<Duration>,
}

impl Fetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            stall_timeout: None,
        }
    }

    pub fn from_section(section: &DownloadSection) -> FetchResult<Self> {
        let client = build_download_client(section)?;
        Ok(Self::new(client).with_stall_timeout(section.stall_timeout()))
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Option<Duration>) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Downloads every record in order. Failed items are skipped; an empty
    /// result is fatal.
    pub async fn download_all(
        &self,
        records: &[LoopRecord],
        workspace: &ScratchWorkspace,
    ) -> PipelineResult<(Vec<DownloadedClip>, Vec<SkippedItem>)> {
        let mut outcomes = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            outcomes.push(self.download(index, &record.source_url, workspace).await);
        }
        let (clips, skipped) = partition_outcomes(outcomes);
        if clips.is_empty() {
            return Err(PipelineError::NoVideosDownloaded);
        }
        info!(
            downloaded = clips.len(),
            failed = skipped.len(),
            "downloads finished"
        );
        Ok((clips, skipped))
    }

    pub async fn download(
        &self,
        index: usize,
        url: &str,
        workspace: &ScratchWorkspace,
    ) -> ItemOutcome<DownloadedClip> {
        let path = workspace.unique_path();
        info!(url, path = %path.display(), "downloading loop");
        match self.fetch_to_file(url, &path).await {
            Ok(bytes) => {
                debug!(url, bytes, "loop downloaded");
                ItemOutcome::Ready(DownloadedClip {
                    index,
                    source_url: url.to_string(),
                    path,
                })
            }
            Err(err) => {
                warn!(url, error = %err, "failed to download loop, skipping");
                if let Err(cleanup) = fs::remove_file(&path).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %cleanup, "failed to remove partial download");
                    }
                }
                ItemOutcome::skipped(Stage::Download, url, err.to_string())
            }
        }
    }

    async fn fetch_to_file(&self, url: &str, path: &Path) -> FetchResult<u64> {
        let parsed = Url::parse(url).map_err(|err| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        match parsed.scheme() {
            "file" => {
                let source = parsed.to_file_path().map_err(|_| FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: "not a local path".into(),
                })?;
                fs::copy(&source, path)
                    .await
                    .map_err(|source_err| FetchError::Io {
                        source: source_err,
                        path: source.clone(),
                    })
            }
            "http" | "https" => self.stream_to_file(parsed, path).await,
            other => Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }

    async fn stream_to_file(&self, url: Url, path: &Path) -> FetchResult<u64> {
        let response = self
            .within_stall_limit(self.client.get(url).send())
            .await??
            .error_for_status()?;
        let mut stream = response.bytes_stream();
        let mut file = fs::File::create(path)
            .await
            .map_err(|source| FetchError::Io {
                source,
                path: path.to_path_buf(),
            })?;
        let mut written = 0u64;
        while let Some(chunk) = self.within_stall_limit(stream.next()).await? {
            let data = chunk?;
            file.write_all(&data)
                .await
                .map_err(|source| FetchError::Io {
                    source,
                    path: path.to_path_buf(),
                })?;
            written += data.len() as u64;
        }
        file.flush().await.map_err(|source| FetchError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        Ok(written)
    }

    async fn within_stall_limit<F: std::future::Future>(&self, step: F) -> FetchResult<F::Output> {
        match self.stall_timeout {
            Some(limit) => timeout(limit, step)
                .await
                .map_err(|_| FetchError::Stalled(limit)),
            None => Ok(step.await),
        }
    }
}
