use std::sync::OnceLock;

use regex::Regex;
use reqwest::Client;
use tracing::info;

use super::error::{CatalogError, CatalogResult};

fn key_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?i)api[_-]?key["']?\s*[:=]\s*["']([A-Za-z0-9]{8,64})["']"#).ok()
        })
        .as_ref()
}

/// First api key literal embedded in a page's markup or inline scripts.
pub fn extract_api_key(html: &str) -> Option<String> {
    key_pattern()?
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string())
}

pub async fn discover_api_key(client: &Client, page_url: &str) -> CatalogResult<String> {
    let html = client
        .get(page_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let key = extract_api_key(&html).ok_or_else(|| CatalogError::KeyNotFound {
        url: page_url.to_string(),
    })?;
    info!(page = page_url, "discovered catalog api key");
    Ok(key)
}
