//! Engine composition and lifecycle.
//!
//! `CacheEngine` wires the tiers, the cluster and the refresher together.
//! Every component receives its collaborators through its constructor;
//! there is no ambient global state. The refresher pair (expiry watcher +
//! refresh queue) runs only while this instance holds the leader role; a
//! supervisor task follows the cluster's role channel and starts or stops
//! the pair on every transition.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use strata_core::{CompositeSource, DataSource, EngineOptions};
use strata_store::{LocalCache, SharedCache, StoreBackend};

use crate::cluster::{Cluster, EntityChange, Role};
use crate::envelope::Message;
use crate::error::Result;
use crate::facade::{Hit, Tiers, TieredCache};
use crate::refresh::RefreshQueue;
use crate::registry::SourceRegistry;
use crate::throttle::{IdentitySigner, RateLimiter, Signer};
use crate::watch::ExpiryWatcher;

/// Builder for a [`CacheEngine`].
pub struct EngineBuilder {
    backend: Arc<dyn StoreBackend>,
    opts: EngineOptions,
    signer: Arc<dyn Signer>,
    registry: SourceRegistry,
}

impl EngineBuilder {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            opts: EngineOptions::default(),
            signer: Arc::new(IdentitySigner),
            registry: SourceRegistry::new(),
        }
    }

    pub fn options(mut self, opts: EngineOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }

    pub fn source(self, source: Arc<dyn DataSource>) -> Self {
        self.registry.register(source);
        self
    }

    pub fn composite_source(self, id: impl Into<String>, composite: CompositeSource) -> Self {
        self.registry.register_composite(id, composite);
        self
    }

    pub fn build(self) -> CacheEngine {
        let registry = Arc::new(self.registry);
        let local = LocalCache::new(self.opts.local.clone());
        let shared = SharedCache::new(Arc::clone(&self.backend), self.opts.cache.clone());
        let cache = TieredCache::new(
            Arc::clone(&local),
            Arc::clone(&shared),
            Arc::clone(&registry),
            self.opts.cache.clone(),
        );
        let cluster = Cluster::new(
            Arc::clone(&self.backend),
            Arc::clone(&shared),
            Arc::clone(&local),
            self.opts.broadcast.clone(),
        );
        let limiter = RateLimiter::new(
            Arc::clone(&self.backend),
            Arc::clone(&local),
            self.signer,
            self.opts.rate_limits.clone(),
        );
        let refresh_queue =
            RefreshQueue::new(Arc::clone(&cache), Arc::clone(&shared), self.opts.refresh.clone());
        let watcher = ExpiryWatcher::new(Arc::clone(&shared), Arc::clone(&refresh_queue));

        CacheEngine {
            backend: self.backend,
            local,
            shared,
            cache,
            registry,
            cluster,
            limiter,
            refresh_queue,
            watcher,
            supervisor: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }
}

/// One cache instance: tiers, cluster presence and background refresh.
pub struct CacheEngine {
    backend: Arc<dyn StoreBackend>,
    local: Arc<LocalCache>,
    shared: Arc<SharedCache>,
    cache: Arc<TieredCache>,
    registry: Arc<SourceRegistry>,
    cluster: Arc<Cluster>,
    limiter: Arc<RateLimiter>,
    refresh_queue: Arc<RefreshQueue>,
    watcher: Arc<ExpiryWatcher>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl CacheEngine {
    pub fn builder(backend: Arc<dyn StoreBackend>) -> EngineBuilder {
        EngineBuilder::new(backend)
    }

    /// Join the cluster and start background maintenance.
    pub async fn start(&self) -> Result<()> {
        Arc::clone(&self.local).spawn_maintenance();
        Arc::clone(&self.cluster).start().await?;
        self.spawn_supervisor();
        tracing::info!(
            instance = %self.cluster.instance_id(),
            backend = self.backend.backend_name(),
            "cache engine started"
        );
        Ok(())
    }

    /// Leave the cluster and stop every component in reverse start order.
    ///
    /// The engine does not close the store backend; whoever constructed the
    /// backend owns its lifecycle (it may be shared by other engines).
    pub async fn stop(&self) {
        self.cancel.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        self.watcher.stop().await;
        self.refresh_queue.stop().await;
        self.cluster.stop().await;
        self.limiter.stop().await;
        self.cache.stop().await;
        self.shared.stop().await;
        self.local.stop().await;
        tracing::info!(instance = %self.cluster.instance_id(), "cache engine stopped");
    }

    /// Look up through both tiers, fetching on a total miss.
    pub async fn get(&self, source_id: &str, params: Value) -> Result<Option<Hit>> {
        self.cache.get(source_id, params).await
    }

    /// Look up through the selected tiers.
    pub async fn get_with(&self, source_id: &str, params: Value, tiers: Tiers) -> Result<Option<Hit>> {
        self.cache.get_with(source_id, params, tiers).await
    }

    /// Recompute an entry in place from its persisted metadata.
    pub async fn refresh(&self, key: &str) -> Result<bool> {
        self.cache.refresh(key).await
    }

    /// Evict a key from both tiers.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.cache.delete(key).await
    }

    /// Whether the target is currently rate limited.
    pub fn is_throttled(&self, target: &Value) -> bool {
        self.limiter.is_throttled(target)
    }

    /// Start tracking an entity kind and tell the other instances to.
    pub async fn track_entity(&self, kind: impl Into<String>) -> Result<()> {
        let kind = kind.into();
        if self.cluster.track_entity(kind.clone()) {
            self.cluster.publish(Message::SubscribeEvent { kind }).await?;
        }
        Ok(())
    }

    /// Report a tracked-entity mutation: evicts dependents from the shared
    /// store and broadcasts the eviction.
    pub async fn entity_changed(&self, change: EntityChange) -> Result<()> {
        self.cluster.entity_changed(change).await
    }

    /// Entity kinds this instance tracks, its own and those learned from
    /// peers.
    pub fn tracked_entities(&self) -> Vec<String> {
        self.cluster.tracked_entities()
    }

    pub fn instance_id(&self) -> Uuid {
        self.cluster.instance_id()
    }

    pub fn is_leader(&self) -> bool {
        self.cluster.is_leader()
    }

    pub fn cache(&self) -> Arc<TieredCache> {
        Arc::clone(&self.cache)
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    pub fn local(&self) -> Arc<LocalCache> {
        Arc::clone(&self.local)
    }

    pub fn shared(&self) -> Arc<SharedCache> {
        Arc::clone(&self.shared)
    }

    pub fn registry(&self) -> Arc<SourceRegistry> {
        Arc::clone(&self.registry)
    }

    fn spawn_supervisor(&self) {
        let mut role_rx = self.cluster.role();
        let queue = Arc::clone(&self.refresh_queue);
        let watcher = Arc::clone(&self.watcher);
        let token = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let role = *role_rx.borrow_and_update();
                match role {
                    Role::Leader => {
                        Arc::clone(&queue).start();
                        if let Err(err) = watcher.start().await {
                            tracing::error!(error = %err, "expiry watcher failed to start");
                        }
                    }
                    Role::Follower => {
                        watcher.stop().await;
                        queue.stop().await;
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = role_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            watcher.stop().await;
            queue.stop().await;
        });
        *self.supervisor.lock() = Some(handle);
    }
}
