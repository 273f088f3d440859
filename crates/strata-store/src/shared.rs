//! The shared cache store.
//!
//! Every logical cache key owns up to three records in the backend: the
//! DATA blob, the INFO metadata hash, and (for refresh-eligible entries) an
//! EXP marker whose native expiry event is the refresh-ahead trigger. This
//! module owns that record layout; nothing above it touches raw store keys.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use strata_core::{CacheEntry, CacheOptions, EntryInfo};

use crate::backend::{Batch, StoreBackend};
use crate::error::Result;
use crate::keys;

/// Delay before dependency registrations are persisted. Batches the bursts
/// a page load produces; a write racing an invalidation inside this window
/// is the documented eventual-consistency gap.
const DEP_DEBOUNCE: Duration = Duration::from_millis(100);

/// Lifetime of the suppression marker installed by explicit deletes, long
/// enough to outlive a racing expiry notification.
const SUPPRESS_TTL: Duration = Duration::from_secs(3);

/// Shared, multi-writer cache store over a [`StoreBackend`].
pub struct SharedCache {
    backend: Arc<dyn StoreBackend>,
    opts: CacheOptions,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl SharedCache {
    pub fn new(backend: Arc<dyn StoreBackend>, opts: CacheOptions) -> Arc<Self> {
        Arc::new(Self {
            backend,
            opts,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn backend(&self) -> Arc<dyn StoreBackend> {
        Arc::clone(&self.backend)
    }

    pub fn options(&self) -> &CacheOptions {
        &self.opts
    }

    /// Read an entry: INFO and DATA in one atomic step.
    ///
    /// A hit bumps the usage counter off the critical path. A DATA blob
    /// that fails to decode counts as a miss (and is logged), never as an
    /// error; recomputation heals it.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let info_key = keys::info_key(key);
        let data_key = keys::data_key(key);
        let (fields, bytes) = self.backend.read_pair(&info_key, &data_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let data = match CacheEntry::decode_data(&bytes) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "undecodable DATA record, treating as miss");
                return Ok(None);
            }
        };
        let info = EntryInfo::from_fields(&fields);

        let backend = Arc::clone(&self.backend);
        self.spawn_tracked(async move {
            if let Err(err) = backend.hash_incr(&info_key, "count", 1).await {
                tracing::warn!(error = %err, "usage counter increment failed");
            }
        });

        Ok(Some(CacheEntry { key: key.to_string(), data, info, dependent_keys: Vec::new() }))
    }

    /// Write an entry: DATA + INFO (+ EXP marker when refresh-eligible) in
    /// one atomic batch, then register its dependency keys after the
    /// debounce delay.
    pub async fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
        let mut info = entry.info.clone();
        if info.ttl_ms <= 0 {
            info.ttl_ms = self.opts.ttl_ms as i64;
        }
        let extra_ms = if info.duration_ms >= self.opts.slow_duration_ms as i64 {
            self.opts.extra_ttl_ms
        } else {
            0
        };
        let data_ttl = Duration::from_millis(info.ttl_ms as u64 + extra_ms);
        let blob = entry
            .encode_data()
            .map_err(|err| crate::error::StoreError::serialization(err.to_string()))?;

        let mut batch = Batch::new()
            .set_bytes(keys::data_key(&entry.key), blob, Some(data_ttl))
            .hash_set(keys::info_key(&entry.key), info.to_fields());
        if info.created_ms == info.timestamp_ms {
            // first write starts the metadata retention clock
            batch = batch.expire(
                keys::info_key(&entry.key),
                Duration::from_millis(self.opts.info_ttl_ms),
            );
        }
        let to_refresh =
            info.is_refreshable() && info.duration_ms >= self.opts.refresh_duration_ms as i64;
        if to_refresh {
            batch = batch.set_bytes(
                keys::exp_key(&entry.key),
                b"1".to_vec(),
                Some(Duration::from_millis(info.ttl_ms as u64)),
            );
        }
        self.backend.apply(batch).await?;

        if !entry.dependent_keys.is_empty() {
            self.register_dependencies(entry.key.clone(), entry.dependent_keys.clone(), data_ttl);
        }
        Ok(())
    }

    /// Reload an entry's metadata, extending its retention window.
    pub async fn touch_info(&self, key: &str) -> Result<Option<EntryInfo>> {
        let info_key = keys::info_key(key);
        let fields = self.backend.hash_get_all(&info_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        self.backend
            .expire(&info_key, Duration::from_millis(self.opts.info_ttl_ms))
            .await?;
        Ok(Some(EntryInfo::from_fields(&fields)))
    }

    /// Rewrite an entry's metadata record.
    pub async fn write_info(&self, key: &str, info: &EntryInfo) -> Result<()> {
        let info_key = keys::info_key(key);
        let batch = Batch::new()
            .hash_set(info_key.clone(), info.to_fields())
            .expire(info_key, Duration::from_millis(self.opts.info_ttl_ms));
        self.backend.apply(batch).await
    }

    /// Remove the DATA and EXP records; INFO is retained for refresh.
    ///
    /// With `ignore_expire`, a short-lived suppression marker masks an
    /// expiry notification racing the delete so the watcher does not
    /// schedule a spurious refresh.
    pub async fn delete(&self, key: &str, ignore_expire: bool) -> Result<()> {
        let mut batch = Batch::new();
        if ignore_expire {
            batch = batch.set_bytes(keys::suppress_key(key), b"1".to_vec(), Some(SUPPRESS_TTL));
        }
        batch = batch.delete(keys::data_key(key)).delete(keys::exp_key(key));
        self.backend.apply(batch).await
    }

    /// Remove every record of a key, INFO included.
    pub async fn delete_all(&self, key: &str) -> Result<()> {
        let batch = Batch::new()
            .delete(keys::data_key(key))
            .delete(keys::info_key(key))
            .delete(keys::exp_key(key));
        self.backend.apply(batch).await
    }

    /// Whether a live DATA record exists.
    pub async fn has_data(&self, key: &str) -> Result<bool> {
        self.backend.exists(&keys::data_key(key)).await
    }

    /// All cache keys registered under a dependency key.
    pub async fn dependents(&self, dependency_key: &str) -> Result<Vec<String>> {
        self.backend.set_members(&keys::dep_key(dependency_key)).await
    }

    /// Verify that a raw `EXP::` key reported by the expiry watch is a
    /// genuine expiry: still gone, not suppressed by an explicit delete.
    /// Returns the underlying cache key.
    pub async fn confirm_expired(&self, raw_key: &str) -> Result<Option<String>> {
        let Some((prefix, key)) = keys::split(raw_key) else {
            return Ok(None);
        };
        if prefix != keys::EXP || key.is_empty() {
            return Ok(None);
        }
        if self.backend.exists(raw_key).await? {
            // marker came back; a fresh write beat us
            return Ok(None);
        }
        if self.backend.exists(&keys::suppress_key(key)).await? {
            return Ok(None);
        }
        Ok(Some(key.to_string()))
    }

    /// Refresh priority of an entry, from its live metadata.
    pub async fn priority_score(&self, key: &str, at_ms: i64) -> Result<Option<f64>> {
        let Some(info) = self.touch_info(key).await? else {
            return Ok(None);
        };
        Ok(Some(info.priority_score(self.opts.slow_duration_ms, at_ms)))
    }

    /// Cancel background work and wait for in-flight tasks.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn register_dependencies(&self, key: String, dependency_keys: Vec<String>, ttl: Duration) {
        let backend = Arc::clone(&self.backend);
        let token = self.cancel.clone();
        self.spawn_tracked(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(DEP_DEBOUNCE) => {}
            }
            for dependency_key in dependency_keys {
                let dep_key = keys::dep_key(&dependency_key);
                let batch = Batch::new().set_add(dep_key.clone(), key.clone()).expire(dep_key, ttl);
                if let Err(err) = backend.apply(batch).await {
                    tracing::warn!(
                        dependency_key = %dependency_key,
                        error = %err,
                        "dependency registration failed"
                    );
                }
            }
        });
    }

    fn spawn_tracked<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.tasks.is_closed() {
            return;
        }
        self.tasks.spawn(future);
    }
}
