//! Core types for the strata caching engine.
//!
//! This crate holds everything the storage and engine layers agree on:
//! the cache entry record and its metadata, deterministic key derivation,
//! the pluggable data-source contract, and the typed configuration options.

pub mod entry;
pub mod error;
pub mod key;
pub mod options;
pub mod source;

pub use entry::{CacheEntry, EntryInfo, now_ms};
pub use error::{CoreError, Result};
pub use key::{cache_key, canonical_json, checksum, dependency_key};
pub use options::{
    BroadcastOptions, CacheOptions, EngineOptions, LocalCacheOptions, RateLimitRule,
    RefreshOptions,
};
pub use source::{
    CompositeSource, DataSource, EntityRef, FetchError, Source, SourceResult,
};
