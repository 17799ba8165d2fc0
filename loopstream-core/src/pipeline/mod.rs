mod assembler;
mod error;
mod fetcher;
mod normalizer;
mod publisher;
mod types;
mod workspace;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{info, warn};

use crate::catalog::{
    build_http_client, discover_api_key, normalize_tag, CatalogClient, CatalogFetch,
    CatalogPolicy, CatalogTransport, HttpCatalogTransport,
};
use crate::config::RunConfig;
use crate::error::ConfigError;
use crate::runner::{CommandExecutor, SystemCommandExecutor};

pub use assembler::{
    concat_manifest, quote_concat_path, staged_path, Assembler, CONCAT_TEMPLATE_VERSION,
    MANIFEST_NAME,
};
pub use error::{PipelineError, PipelineResult};
pub use fetcher::{build_download_client, FetchError, Fetcher};
pub use normalizer::{
    escape_drawtext, escape_filtergraph, escape_option_value, normalized_path, Normalizer,
    NORMALIZE_TEMPLATE_VERSION,
};
pub use publisher::{compute_sha256, Publisher};
pub use types::{
    partition_outcomes, DownloadedClip, ItemOutcome, NormalizedClip, PublishedArtifact,
    RunContext, RunReport, SkippedItem, Stage, StreamArtifact,
};
pub use workspace::{ScratchWorkspace, WORKSPACE_PREFIX};

/// One batch run: catalog → download → normalize → concatenate → publish.
pub struct Pipeline {
    context: RunContext,
    http_client: Client,
    fetcher: Fetcher,
    transport: Option<Arc<dyn CatalogTransport>>,
    executor: Arc<dyn CommandExecutor>,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> PipelineResult<Self> {
        config.validate()?;
        let http_client = build_http_client(&config.catalog)?;
        let fetcher = Fetcher::from_section(&config.download)
            .map_err(|err| ConfigError::invalid("download", err.to_string()))?;
        Ok(Self {
            context: RunContext::new(config),
            http_client,
            fetcher,
            transport: None,
            executor: Arc::new(SystemCommandExecutor),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn CatalogTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.context = self.context.with_started_at(started_at);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Explicit key first, then the configured public page.
    pub async fn resolve_api_key(&self) -> PipelineResult<String> {
        let catalog = &self.context.config.catalog;
        if let Some(key) = catalog
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        {
            return Ok(key.to_string());
        }
        match catalog.key_page_url.as_deref() {
            Some(page) => Ok(discover_api_key(&self.http_client, page).await?),
            None => Err(ConfigError::MissingCredential.into()),
        }
    }

    async fn catalog_client(&self) -> PipelineResult<CatalogClient> {
        let section = &self.context.config.catalog;
        let transport = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => {
                let api_key = self.resolve_api_key().await?;
                Arc::new(HttpCatalogTransport::new(
                    self.http_client.clone(),
                    section,
                    api_key,
                )?) as Arc<dyn CatalogTransport>
            }
        };
        Ok(CatalogClient::new(transport, CatalogPolicy::from(section)))
    }

    pub async fn fetch_loop_urls(&self) -> PipelineResult<CatalogFetch> {
        let section = &self.context.config.catalog;
        let exclude_tags: BTreeSet<String> = section
            .exclude_tags
            .iter()
            .map(|tag| normalize_tag(tag))
            .filter(|tag| !tag.is_empty())
            .collect();
        let client = self.catalog_client().await?;
        Ok(client
            .fetch_loop_urls(section.count as usize, &exclude_tags)
            .await?)
    }

    pub async fn run(&self) -> PipelineResult<RunReport> {
        let fetch = self.fetch_loop_urls().await?;

        let config = &self.context.config;
        let workspace = ScratchWorkspace::create(config.workspace.root.as_deref())?;
        info!(path = %workspace.path().display(), "scratch workspace created");

        let workspace_path = workspace.path().to_path_buf();
        let outcome = self.process(&fetch, &workspace).await;
        if let Err(err) = workspace.close() {
            warn!(path = %workspace_path.display(), error = %err, "failed to remove scratch workspace");
        }
        outcome
    }

    async fn process(
        &self,
        fetch: &CatalogFetch,
        workspace: &ScratchWorkspace,
    ) -> PipelineResult<RunReport> {
        let config = &self.context.config;

        let (downloaded, mut skipped) = self
            .fetcher
            .download_all(&fetch.records, workspace)
            .await?;
        let downloaded_count = downloaded.len();

        let normalizer = Normalizer::new(config.transcode.clone(), Arc::clone(&self.executor));
        let (normalized, normalize_skipped) = normalizer.normalize_all(downloaded).await?;
        skipped.extend(normalize_skipped);

        let assembler = Assembler::new(
            config.transcode.clone(),
            config.output.clone(),
            Arc::clone(&self.executor),
        );
        let artifact = assembler
            .concatenate(&normalized, workspace, &self.context)
            .await?;

        let publisher = Publisher::new(config.output.clone(), config.redirect.clone());
        let published = publisher.publish(&artifact).await?;

        info!(
            clips = normalized.len(),
            skipped = skipped.len(),
            location = %published.location.display(),
            "done"
        );
        Ok(RunReport {
            started_at: self.context.started_at,
            finished_at: Utc::now(),
            requested: config.catalog.count,
            urls_found: fetch.records.len(),
            catalog_requests: fetch.requests,
            downloaded: downloaded_count,
            normalized: normalized.len(),
            skipped,
            artifact: published,
        })
    }
}
