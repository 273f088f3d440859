//! The per-instance local cache tier.
//!
//! A bounded TTL map owned by exactly one process. Entries promoted from
//! the shared tier live here for at most `default_ttl_ms` so a stale local
//! copy cannot outlive cross-instance invalidation by much; `permanent`
//! slots (config snapshots, throttle block markers) bypass expiry entirely
//! because they are read on hot paths that cannot afford a store round trip.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use strata_core::{CacheEntry, LocalCacheOptions, now_ms};

/// Occupancy factor above which a write triggers a synchronous sweep.
const SWEEP_FACTOR: f64 = 1.33;

/// Occupancy fraction above which maintenance logs a warning.
const WARN_FRACTION: f64 = 0.8;

#[derive(Clone)]
enum StoredValue {
    Entry(Arc<CacheEntry>),
    Value(Value),
}

struct Slot {
    stored: StoredValue,
    /// `None` means the slot never expires.
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, at: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => at >= expires_at,
            None => false,
        }
    }
}

/// Bounded per-instance TTL map.
pub struct LocalCache {
    map: DashMap<String, Slot>,
    opts: LocalCacheOptions,
    cancel: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl LocalCache {
    pub fn new(opts: LocalCacheOptions) -> Arc<Self> {
        Arc::new(Self {
            map: DashMap::new(),
            opts,
            cancel: CancellationToken::new(),
            maintenance: Mutex::new(None),
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Store a cache entry under its key.
    ///
    /// Returns false (backpressure, not an error) when the entry is already
    /// expired or the cache is at capacity after a sweep. The resident TTL
    /// of a non-permanent entry is capped at `default_ttl_ms`.
    pub fn save(&self, entry: Arc<CacheEntry>) -> bool {
        let now = now_ms();
        let timestamp = if entry.info.timestamp_ms > 0 { entry.info.timestamp_ms } else { now };
        let remaining_ms = entry.info.ttl_ms - (now - timestamp);
        if entry.info.permanent {
            return self.insert(entry.key.clone(), StoredValue::Entry(entry), None);
        }
        if remaining_ms <= 0 {
            return false;
        }
        let local_ttl = (remaining_ms as u64).min(self.opts.default_ttl_ms);
        let expires_at = Instant::now() + Duration::from_millis(local_ttl);
        self.insert(entry.key.clone(), StoredValue::Entry(entry), Some(expires_at))
    }

    /// Load a cache entry, honoring expiry.
    pub fn load(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let slot = self.map.get(key)?;
        if slot.is_expired(Instant::now()) {
            return None;
        }
        match &slot.stored {
            StoredValue::Entry(entry) => Some(Arc::clone(entry)),
            StoredValue::Value(_) => None,
        }
    }

    /// Store a raw value with a TTL (throttle block markers).
    pub fn put_value(&self, key: impl Into<String>, value: Value, ttl: Duration) -> bool {
        self.insert(key.into(), StoredValue::Value(value), Some(Instant::now() + ttl))
    }

    /// Store a raw value that never expires (config snapshots).
    pub fn put_permanent(&self, key: impl Into<String>, value: Value) -> bool {
        self.insert(key.into(), StoredValue::Value(value), None)
    }

    /// Load a raw value, honoring expiry.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let slot = self.map.get(key)?;
        if slot.is_expired(Instant::now()) {
            return None;
        }
        match &slot.stored {
            StoredValue::Value(value) => Some(value.clone()),
            StoredValue::Entry(_) => None,
        }
    }

    /// Whether a live slot exists under `key`.
    pub fn has(&self, key: &str) -> bool {
        self.map
            .get(key)
            .map(|slot| !slot.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    /// Remove a slot. Idempotent.
    pub fn delete(&self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    /// Remove expired non-permanent slots. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, slot| !slot.is_expired(now));
        before - self.map.len()
    }

    fn insert(&self, key: String, stored: StoredValue, expires_at: Option<Instant>) -> bool {
        if self.map.len() as f64 > self.opts.max_size as f64 * SWEEP_FACTOR {
            self.sweep();
            if self.map.len() >= self.opts.max_size {
                return false;
            }
        }
        self.map.insert(key, Slot { stored, expires_at });
        true
    }

    /// Start the periodic maintenance sweep.
    pub fn spawn_maintenance(self: Arc<Self>) {
        let cache = Arc::clone(&self);
        let token = self.cancel.clone();
        let interval = Duration::from_millis(self.opts.timer_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = cache.sweep();
                        let len = cache.map.len();
                        if removed > 0 {
                            tracing::debug!(removed, len, "local cache sweep");
                        }
                        if len as f64 > cache.opts.max_size as f64 * WARN_FRACTION {
                            tracing::warn!(
                                len,
                                max_size = cache.opts.max_size,
                                "local cache occupancy above 80%"
                            );
                        }
                    }
                }
            }
        });
        *self.maintenance.lock() = Some(handle);
    }

    /// Cancel maintenance and drop all slots.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.clear();
    }
}
