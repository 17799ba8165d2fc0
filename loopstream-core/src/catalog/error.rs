use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid catalog url: {0}")]
    Url(#[from] url::ParseError),
    #[error("malformed catalog response: {0}")]
    Body(String),
    #[error("catalog request at offset {offset} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        offset: u32,
        attempts: u32,
        last_error: String,
    },
    #[error("no api key found on {url}")]
    KeyNotFound { url: String },
}

impl From<reqwest::Error> for CatalogError {
    fn from(error: reqwest::Error) -> Self {
        CatalogError::Network(error.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(error: serde_json::Error) -> Self {
        CatalogError::Body(error.to_string())
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;
