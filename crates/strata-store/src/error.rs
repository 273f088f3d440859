use thiserror::Error;

/// Errors surfaced by store backends and the cache tiers built on them.
///
/// Store failures are transient by contract: callers at tier boundaries
/// absorb them (falling through to the next tier) rather than failing the
/// request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store pool error: {0}")]
    Pool(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("store subscribe error: {0}")]
    Subscribe(String),

    #[error("store serialization error: {0}")]
    Serialization(String),

    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool(message.into())
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }

    pub fn subscribe(message: impl Into<String>) -> Self {
        Self::Subscribe(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }
}

/// Convenience result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
