//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use strata_core::{
    DataSource, EngineOptions, EntityRef, FetchError, SourceResult,
};

/// Initialize test logging once; repeated calls are fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Engine options tuned for fast convergence in tests.
pub fn fast_options() -> EngineOptions {
    let mut opts = EngineOptions::default();
    opts.broadcast.heartbeat_interval_ms = 20;
    opts.local.timer_interval_ms = 50;
    opts.refresh.refresh_interval_ms = 50;
    opts.refresh.size_ratio = 1.0;
    opts.refresh.time_ratio = 1.0;
    opts
}

/// A data source that counts fetches and can change its answer.
pub struct CountingSource {
    id: String,
    data: Mutex<Value>,
    dependencies: Vec<EntityRef>,
    delay: Duration,
    fetches: AtomicUsize,
    last_params: Mutex<Value>,
}

impl CountingSource {
    pub fn new(id: &str, data: Value) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            data: Mutex::new(data),
            dependencies: Vec::new(),
            delay: Duration::from_millis(5),
            fetches: AtomicUsize::new(0),
            last_params: Mutex::new(Value::Null),
        })
    }

    pub fn with_dependencies(id: &str, data: Value, dependencies: Vec<EntityRef>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            data: Mutex::new(data),
            dependencies,
            delay: Duration::from_millis(5),
            fetches: AtomicUsize::new(0),
            last_params: Mutex::new(Value::Null),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn set_data(&self, data: Value) {
        *self.data.lock().unwrap() = data;
    }

    pub fn last_params(&self) -> Value {
        self.last_params.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataSource for CountingSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, params: &Value) -> Result<SourceResult, FetchError> {
        tokio::time::sleep(self.delay).await;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().unwrap() = params.clone();
        let data = self.data.lock().unwrap().clone();
        if data.is_null() {
            return Err(FetchError::NotFound);
        }
        Ok(SourceResult::new(data).with_dependencies(self.dependencies.clone()))
    }
}

/// A data source that always fails hard.
pub struct FailingSource;

#[async_trait]
impl DataSource for FailingSource {
    fn id(&self) -> &str {
        "failing"
    }

    async fn fetch(&self, _params: &Value) -> Result<SourceResult, FetchError> {
        Err(FetchError::failed("backend exploded"))
    }
}

/// Poll a synchronous predicate until it holds or the deadline passes.
pub async fn eventually<F>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    false
}

/// Poll an async predicate until it holds or the deadline passes.
pub async fn eventually_async<F, Fut>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    while started.elapsed() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    false
}
