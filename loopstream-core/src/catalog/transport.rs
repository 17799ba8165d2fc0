use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::config::CatalogSection;

use super::error::{CatalogError, CatalogResult};

/// Source of raw catalog pages.
#[async_trait]
pub trait CatalogTransport: Send + Sync {
    async fn fetch_page(&self, offset: u32, limit: u32) -> CatalogResult<String>;
}

pub struct HttpCatalogTransport {
    client: Client,
    base: Url,
    api_key: String,
}

impl HttpCatalogTransport {
    pub fn new(client: Client, section: &CatalogSection, api_key: String) -> CatalogResult<Self> {
        let base = Url::parse(&format!(
            "{}/{}",
            section.endpoint.trim_end_matches('/'),
            section.route.trim_start_matches('/')
        ))?;
        Ok(Self {
            client,
            base,
            api_key,
        })
    }

    pub fn page_url(&self, offset: u32, limit: u32) -> Url {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        url
    }
}

#[async_trait]
impl CatalogTransport for HttpCatalogTransport {
    async fn fetch_page(&self, offset: u32, limit: u32) -> CatalogResult<String> {
        let response = self
            .client
            .get(self.page_url(offset, limit))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

impl fmt::Debug for HttpCatalogTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCatalogTransport")
            .field("base", &self.base.as_str())
            .finish()
    }
}

pub(crate) fn build_http_client(section: &CatalogSection) -> CatalogResult<Client> {
    Client::builder()
        .user_agent(concat!("loopstream/", env!("CARGO_PKG_VERSION")))
        .timeout(section.request_timeout())
        .build()
        .map_err(|err| CatalogError::Network(err.to_string()))
}
