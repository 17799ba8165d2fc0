mod error;
mod key;
mod record;
mod transport;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::CatalogSection;

pub use error::{CatalogError, CatalogResult};
pub use key::{discover_api_key, extract_api_key};
pub use record::{classify_record, normalize_tag, parse_page, LoopRecord, RecordDecision};
pub use transport::{CatalogTransport, HttpCatalogTransport};

pub(crate) use transport::build_http_client;

#[derive(Debug, Clone)]
pub struct CatalogPolicy {
    pub batch_size: u32,
    pub max_requests: u32,
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl CatalogPolicy {
    /// Linear backoff: the n-th retry waits n units.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_unit * retry
    }
}

impl From<&CatalogSection> for CatalogPolicy {
    fn from(section: &CatalogSection) -> Self {
        Self {
            batch_size: section.batch_size,
            max_requests: section.max_requests,
            max_retries: section.max_retries,
            backoff_unit: section.backoff_unit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogFetch {
    pub records: Vec<LoopRecord>,
    pub requests: u32,
    pub excluded: usize,
    pub unusable: usize,
    pub duplicates: usize,
}

pub struct CatalogClient {
    transport: Arc<dyn CatalogTransport>,
    policy: CatalogPolicy,
}

impl CatalogClient {
    pub fn new(transport: Arc<dyn CatalogTransport>, policy: CatalogPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &CatalogPolicy {
        &self.policy
    }

    /// Collects up to `desired` records in catalog order, skipping excluded,
    /// malformed and repeated entries. Stops at `desired` or after
    /// `max_requests` pages, whichever comes first.
    pub async fn fetch_loop_urls(
        &self,
        desired: usize,
        exclude_tags: &BTreeSet<String>,
    ) -> CatalogResult<CatalogFetch> {
        info!(desired, "requesting loop urls");
        let mut fetch = CatalogFetch::default();
        let mut seen = HashSet::new();

        while fetch.records.len() < desired && fetch.requests < self.policy.max_requests {
            let offset = fetch.requests * self.policy.batch_size;
            let page = self.fetch_page_with_retry(offset).await?;
            fetch.requests += 1;

            for raw in &page {
                match classify_record(raw, exclude_tags) {
                    RecordDecision::Keep(record) => {
                        if seen.insert(record.source_url.clone()) {
                            fetch.records.push(record);
                        } else {
                            fetch.duplicates += 1;
                            debug!(url = %record.source_url, "skipping duplicate loop");
                        }
                    }
                    RecordDecision::Excluded { matched } => {
                        fetch.excluded += 1;
                        info!(tags = ?matched, "skipping loop with excluded tags");
                    }
                    RecordDecision::Unusable(reason) => {
                        fetch.unusable += 1;
                        debug!(reason = %reason, "skipping unusable catalog record");
                    }
                }
                if fetch.records.len() >= desired {
                    break;
                }
            }

            info!(
                found = fetch.records.len(),
                requests = fetch.requests,
                offset,
                "catalog page processed"
            );
        }

        if fetch.records.len() < desired {
            warn!(
                found = fetch.records.len(),
                desired,
                requests = fetch.requests,
                "request ceiling reached before collecting the desired number of loops"
            );
        }
        info!(
            found = fetch.records.len(),
            requests = fetch.requests,
            "retrieved loop urls"
        );
        Ok(fetch)
    }

    async fn fetch_page_with_retry(&self, offset: u32) -> CatalogResult<Vec<serde_json::Value>> {
        let mut retries = 0u32;
        loop {
            let attempt = self
                .transport
                .fetch_page(offset, self.policy.batch_size)
                .await
                .and_then(|body| parse_page(&body));
            match attempt {
                Ok(page) => return Ok(page),
                Err(err) => {
                    retries += 1;
                    if retries > self.policy.max_retries {
                        return Err(CatalogError::RetriesExhausted {
                            offset,
                            attempts: retries,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = self.policy.backoff(retries);
                    warn!(offset, retry = retries, wait = ?delay, error = %err, "catalog request failed, retrying");
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}
