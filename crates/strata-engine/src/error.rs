use thiserror::Error;

use strata_core::CoreError;
use strata_store::StoreError;

/// Errors surfaced by the cache facade and engine lifecycle.
///
/// Store failures are absorbed at tier boundaries wherever a fallback
/// exists; they only reach callers when no tier could serve. Data-source
/// failures always propagate. "Not found" is never an error; the facade
/// returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unknown data source: {0}")]
    UnknownSource(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data source error: {0}")]
    Source(String),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl CacheError {
    pub fn unknown_source(id: impl Into<String>) -> Self {
        Self::UnknownSource(id.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Convenience result type for engine operations
pub type Result<T> = std::result::Result<T, CacheError>;
