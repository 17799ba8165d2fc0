use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::CatalogResult;

/// One usable catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopRecord {
    pub source_url: String,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordDecision {
    Keep(LoopRecord),
    Excluded { matched: Vec<String> },
    Unusable(String),
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct LoopImages {
    images: LoopRenditions,
}

#[derive(Debug, Deserialize)]
struct LoopRenditions {
    looping: LoopRendition,
}

#[derive(Debug, Deserialize)]
struct LoopRendition {
    mp4: String,
}

/// Splits a page body into its raw records. Fails only when the envelope
/// itself is unreadable; individual records are judged by [`classify_record`].
pub fn parse_page(body: &str) -> CatalogResult<Vec<Value>> {
    let page: CatalogPage = serde_json::from_str(body)?;
    Ok(page.data)
}

pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

pub fn classify_record(record: &Value, exclude_tags: &BTreeSet<String>) -> RecordDecision {
    let tags = match record.get("tags") {
        None | Some(Value::Null) => BTreeSet::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(normalize_tag)
            .filter(|tag| !tag.is_empty())
            .collect(),
        Some(other) => return RecordDecision::Unusable(format!("tags is not an array: {other}")),
    };

    let matched: Vec<String> = tags.intersection(exclude_tags).cloned().collect();
    if !matched.is_empty() {
        return RecordDecision::Excluded { matched };
    }

    let images = match LoopImages::deserialize(record) {
        Ok(images) => images,
        Err(err) => return RecordDecision::Unusable(err.to_string()),
    };
    let source_url = images.images.looping.mp4.trim().to_string();
    if source_url.is_empty() {
        return RecordDecision::Unusable("empty looping url".to_string());
    }
    RecordDecision::Keep(LoopRecord { source_url, tags })
}
