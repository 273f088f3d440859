//! The pluggable data-source contract.
//!
//! A data source knows how to normalize request parameters (`reduce`) and
//! how to produce a value for them (`fetch`). The engine never inspects
//! source internals; it dispatches over the [`Source`] variants.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Reference to an upstream entity a cache entry depends on.
///
/// `id` is absent for aggregate results (counts, listings) that must be
/// invalidated by any mutation of the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: Some(id.into()) }
    }

    pub fn kind_only(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: None }
    }
}

/// Successful fetch output.
#[derive(Debug, Clone, Default)]
pub struct SourceResult {
    pub data: Value,
    pub metadata: Option<BTreeMap<String, String>>,
    pub dependencies: Vec<EntityRef>,
}

impl SourceResult {
    pub fn new(data: Value) -> Self {
        Self { data, ..Self::default() }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<EntityRef>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Fetch failure modes.
///
/// `NotFound` means the source has no data for the parameters; it is a
/// representable outcome, not an infrastructure failure, and is never
/// persisted. Anything else is a hard error propagated to the caller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not found")]
    NotFound,

    #[error("source failed: {0}")]
    Failed(String),
}

impl FetchError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A single upstream data source.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Stable identifier, persisted in entry metadata so background refresh
    /// can find the source again.
    fn id(&self) -> &str;

    /// Normalize parameters before key derivation.
    ///
    /// Dropping parameters that do not influence this source's output (a
    /// pagination block on a count query, say) collapses would-be duplicate
    /// cache entries onto one key.
    fn reduce(&self, params: Value) -> Value {
        params
    }

    /// Produce the value for a reduced parameter set.
    async fn fetch(&self, params: &Value) -> Result<SourceResult, FetchError>;
}

/// A source as registered with the engine.
///
/// Dispatch is a pattern match over the two shapes rather than runtime type
/// inspection of the registered object.
#[derive(Clone)]
pub enum Source {
    /// One upstream source.
    Single(Arc<dyn DataSource>),
    /// Aggregation of named parts into one object value.
    Composite(CompositeSource),
}

impl Source {
    pub fn single(source: Arc<dyn DataSource>) -> Self {
        Self::Single(source)
    }

    pub fn reduce(&self, params: Value) -> Value {
        match self {
            Self::Single(source) => source.reduce(params),
            Self::Composite(composite) => composite.reduce(params),
        }
    }

    pub async fn fetch(&self, params: &Value) -> Result<SourceResult, FetchError> {
        match self {
            Self::Single(source) => source.fetch(params).await,
            Self::Composite(composite) => composite.fetch(params).await,
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(source) => write!(f, "Source::Single({})", source.id()),
            Self::Composite(composite) => {
                write!(f, "Source::Composite({} parts)", composite.parts.len())
            }
        }
    }
}

/// Aggregates several sources into one response object, keyed by part name.
///
/// A part that reports `NotFound` contributes `null`; the composite itself
/// is `NotFound` only when every part is. Dependencies and metadata of the
/// parts are merged.
#[derive(Clone, Default)]
pub struct CompositeSource {
    parts: Vec<(String, Arc<dyn DataSource>)>,
}

impl CompositeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_part(mut self, name: impl Into<String>, source: Arc<dyn DataSource>) -> Self {
        self.parts.push((name.into(), source));
        self
    }

    /// Parts reduce in registration order, each seeing the previous
    /// reduction, so the derived key reflects every part's normalization.
    fn reduce(&self, params: Value) -> Value {
        self.parts
            .iter()
            .fold(params, |acc, (_, source)| source.reduce(acc))
    }

    async fn fetch(&self, params: &Value) -> Result<SourceResult, FetchError> {
        let mut data = Map::new();
        let mut metadata: BTreeMap<String, String> = BTreeMap::new();
        let mut dependencies = Vec::new();
        let mut found = false;
        for (name, source) in &self.parts {
            match source.fetch(params).await {
                Ok(result) => {
                    found = true;
                    data.insert(name.clone(), result.data);
                    if let Some(part_meta) = result.metadata {
                        metadata.extend(part_meta);
                    }
                    dependencies.extend(result.dependencies);
                }
                Err(FetchError::NotFound) => {
                    data.insert(name.clone(), Value::Null);
                }
                Err(err) => return Err(err),
            }
        }
        if !found {
            return Err(FetchError::NotFound);
        }
        dependencies.dedup();
        Ok(SourceResult {
            data: Value::Object(data),
            metadata: if metadata.is_empty() { None } else { Some(metadata) },
            dependencies,
        })
    }
}
