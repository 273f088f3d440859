//! The cache facade: one `get`/`refresh`/`delete` surface over both tiers
//! and the data sources.
//!
//! Lookup order is local tier, shared tier, source. Each tier that misses
//! is repopulated on the way back. Store failures fall through to the next
//! tier; source failures propagate; a source's "not found" is `Ok(None)`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use strata_core::{
    cache_key, checksum, dependency_key, now_ms, CacheEntry, CacheOptions, EntryInfo, FetchError,
    Source,
};
use strata_store::{LocalCache, SharedCache};

use crate::error::{CacheError, Result};
use crate::registry::SourceRegistry;

/// Delay before a background refresh fires, letting the triggering request
/// finish first.
const BACKGROUND_REFRESH_DELAY: Duration = Duration::from_millis(100);

/// Which tiers a lookup consults.
#[derive(Debug, Clone, Copy)]
pub struct Tiers {
    pub local: bool,
    pub shared: bool,
}

impl Default for Tiers {
    fn default() -> Self {
        Self { local: true, shared: true }
    }
}

/// Where a hit was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Shared,
    Fetch,
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct Hit {
    pub entry: Arc<CacheEntry>,
    pub origin: Origin,
}

/// Two-tier cache facade.
///
/// Cloning is cheap (shared handles) and clones drive the same background
/// task tracker, so a clone handed to a spawned task still honors `stop`.
#[derive(Clone)]
pub struct TieredCache {
    local: Arc<LocalCache>,
    shared: Arc<SharedCache>,
    registry: Arc<SourceRegistry>,
    opts: CacheOptions,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl TieredCache {
    pub fn new(
        local: Arc<LocalCache>,
        shared: Arc<SharedCache>,
        registry: Arc<SourceRegistry>,
        opts: CacheOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            shared,
            registry,
            opts,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// The cache key a lookup would use, after parameter reduction.
    pub fn key_for(&self, source_id: &str, params: Value) -> Result<String> {
        let source = self
            .registry
            .get(source_id)
            .ok_or_else(|| CacheError::unknown_source(source_id))?;
        let reduced = source.reduce(params);
        Ok(cache_key(source_id, &reduced))
    }

    /// Look up through both tiers, fetching from the source on a total miss.
    pub async fn get(&self, source_id: &str, params: Value) -> Result<Option<Hit>> {
        self.get_with(source_id, params, Tiers::default()).await
    }

    /// Look up through the selected tiers.
    pub async fn get_with(
        &self,
        source_id: &str,
        params: Value,
        tiers: Tiers,
    ) -> Result<Option<Hit>> {
        let source = self
            .registry
            .get(source_id)
            .ok_or_else(|| CacheError::unknown_source(source_id))?;
        let reduced = source.reduce(params);
        let key = cache_key(source_id, &reduced);

        if tiers.local {
            if let Some(entry) = self.local.load(&key) {
                return Ok(Some(Hit { entry, origin: Origin::Local }));
            }
        }

        if tiers.shared {
            match self.shared.get_entry(&key).await {
                Ok(Some(entry)) => {
                    let entry = Arc::new(entry);
                    if tiers.local {
                        self.local.save(Arc::clone(&entry));
                    }
                    self.maybe_refresh_ahead(&entry);
                    return Ok(Some(Hit { entry, origin: Origin::Shared }));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "shared tier read failed, falling through");
                }
            }
        }

        match self
            .fetch_and_store(&key, source_id, &source, reduced, None, tiers.shared)
            .await?
        {
            Some(entry) => {
                let entry = Arc::new(entry);
                if tiers.local && !entry.data.is_null() {
                    self.local.save(Arc::clone(&entry));
                }
                Ok(Some(Hit { entry, origin: Origin::Fetch }))
            }
            None => Ok(None),
        }
    }

    /// Recompute an entry in place from its persisted metadata.
    ///
    /// When a peer instance already refreshed it (the stored checksum moved
    /// between the metadata read and the entry read), that result is adopted
    /// instead of fetching again. Returns false when the entry is unknown or
    /// not refreshable.
    pub async fn refresh(&self, key: &str) -> Result<bool> {
        let Some(info) = self.shared.touch_info(key).await? else {
            return Ok(false);
        };
        if !info.is_refreshable() {
            return Ok(false);
        }
        if let Ok(Some(entry)) = self.shared.get_entry(key).await {
            if entry.info.checksum != info.checksum {
                let entry = Arc::new(entry);
                self.local.save(Arc::clone(&entry));
                return Ok(true);
            }
        }
        let source = self
            .registry
            .get(&info.source)
            .ok_or_else(|| CacheError::unknown_source(info.source.clone()))?;
        let source_id = info.source.clone();
        let params = info.params.clone();
        match self
            .fetch_and_store(key, &source_id, &source, params, Some(info), true)
            .await?
        {
            Some(entry) => {
                let entry = Arc::new(entry);
                if !entry.data.is_null() {
                    self.local.save(entry);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Evict an entry from both tiers. Idempotent; entry metadata survives
    /// so a later refresh can resurrect the entry.
    pub async fn delete(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::config("cache key is required"));
        }
        self.shared.delete(key, true).await?;
        self.local.delete(key);
        Ok(())
    }

    /// Cancel background refreshes and wait them out.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Fetch from the source and commit the result to the shared tier.
    ///
    /// `prior` carries persisted metadata so creation time, modification
    /// time and TTL survive recomputation. A shared-tier write failure is
    /// logged, not fatal: the caller still gets the fetched entry.
    async fn fetch_and_store(
        &self,
        key: &str,
        source_id: &str,
        source: &Source,
        params: Value,
        prior: Option<EntryInfo>,
        write_shared: bool,
    ) -> Result<Option<CacheEntry>> {
        let started = Instant::now();
        let result = match source.fetch(&params).await {
            Ok(result) => result,
            Err(FetchError::NotFound) => return Ok(None),
            Err(FetchError::Failed(message)) => return Err(CacheError::Source(message)),
        };
        let now = now_ms();
        let duration_ms = started.elapsed().as_millis() as i64;
        let digest = checksum(&result.data);
        let prior = prior.unwrap_or_default();
        let changed = prior.checksum != digest;

        let info = EntryInfo {
            params,
            source: source_id.to_string(),
            metadata: result.metadata.map(|metadata| {
                metadata
                    .into_iter()
                    .map(|(name, value)| (name.to_lowercase(), value))
                    .collect()
            }),
            checksum: digest,
            timestamp_ms: now,
            modified_ms: if changed { now } else { prior.modified_ms },
            created_ms: if prior.created_ms > 0 { prior.created_ms } else { now },
            ttl_ms: if prior.ttl_ms > 0 { prior.ttl_ms } else { self.opts.ttl_ms as i64 },
            duration_ms,
            count: prior.count,
            permanent: prior.permanent,
        };
        let dependent_keys = result
            .dependencies
            .iter()
            .filter_map(|entity| match dependency_key(entity) {
                Ok(dependency_key) => Some(dependency_key),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unusable dependency declaration");
                    None
                }
            })
            .collect();

        let entry = CacheEntry { key: key.to_string(), data: result.data, info, dependent_keys };
        if write_shared {
            if let Err(err) = self.shared.put_entry(&entry).await {
                tracing::warn!(key = %key, error = %err, "shared tier write failed, serving uncached");
            }
        }
        Ok(Some(entry))
    }

    /// Schedule a non-blocking refresh for a slow entry close to expiry.
    fn maybe_refresh_ahead(&self, entry: &Arc<CacheEntry>) {
        let info = &entry.info;
        if !info.is_refreshable() || info.timestamp_ms == 0 {
            return;
        }
        if info.duration_ms < self.opts.slow_duration_ms as i64 {
            return;
        }
        if entry.remaining_ttl_ms(now_ms()) > self.opts.early_refresh_ms as i64 {
            return;
        }
        if self.tasks.is_closed() {
            return;
        }
        let cache = self.clone();
        let key = entry.key.clone();
        let token = self.cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(BACKGROUND_REFRESH_DELAY) => {}
            }
            match cache.refresh(&key).await {
                Ok(true) => tracing::debug!(key = %key, "refreshed ahead of expiry"),
                Ok(false) => {}
                Err(err) => tracing::warn!(key = %key, error = %err, "early refresh failed"),
            }
        });
    }
}
