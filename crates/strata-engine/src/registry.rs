//! Source registry: stable source ids to [`Source`] instances.
//!
//! Entry metadata stores only the source id, so background refresh has to
//! resolve ids back to live sources here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use strata_core::{CompositeSource, DataSource, Source};

#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single source under its own id.
    pub fn register(&self, source: Arc<dyn DataSource>) {
        let id = source.id().to_string();
        self.sources.write().insert(id, Source::single(source));
    }

    /// Register a composite source under an explicit id.
    pub fn register_composite(&self, id: impl Into<String>, composite: CompositeSource) {
        self.sources.write().insert(id.into(), Source::Composite(composite));
    }

    pub fn get(&self, id: &str) -> Option<Source> {
        self.sources.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use strata_core::{FetchError, SourceResult};

    struct Probe;

    #[async_trait]
    impl DataSource for Probe {
        fn id(&self) -> &str {
            "probe"
        }

        async fn fetch(&self, _params: &Value) -> Result<SourceResult, FetchError> {
            Ok(SourceResult::new(Value::Null))
        }
    }

    #[test]
    fn register_and_resolve() {
        let registry = SourceRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(Probe));
        registry.register_composite("combined", CompositeSource::new());
        assert_eq!(registry.len(), 2);
        assert!(matches!(registry.get("probe"), Some(Source::Single(_))));
        assert!(matches!(registry.get("combined"), Some(Source::Composite(_))));
        assert!(registry.get("missing").is_none());
    }
}
