use thiserror::Error;

/// Core error types for strata operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing cache key")]
    MissingKey,

    #[error("invalid entity reference: {0}")]
    InvalidEntity(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data encode error: {0}")]
    Encode(String),

    #[error("data decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    /// Create a new InvalidEntity error
    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity(message.into())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<rmp_serde::encode::Error> for CoreError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CoreError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
