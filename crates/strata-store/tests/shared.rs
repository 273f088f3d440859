//! Integration tests for [`strata_store::SharedCache`].
//!
//! These live as an integration test (rather than a `#[cfg(test)]` module
//! inside the crate) because they depend on `strata-store-memory`, which in
//! turn depends on `strata-store`. A unit-test build recompiles the crate
//! under `cfg(test)`, yielding two distinct `strata-store` instances and a
//! trait-mismatch against the backend. Integration tests link the plain lib,
//! so the single instance is shared.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use strata_core::{CacheEntry, CacheOptions};
use strata_store::keys;
use strata_store::{SharedCache, StoreBackend};
use strata_store_memory::MemoryBackend;

fn shared() -> Arc<SharedCache> {
    SharedCache::new(MemoryBackend::start(), CacheOptions::default())
}

fn entry(key: &str, ttl_ms: i64, duration_ms: i64) -> CacheEntry {
    let mut entry = CacheEntry::new(key, json!({"key": key}));
    entry.info.source = "test-source".to_string();
    entry.info.params = json!({"id": key});
    entry.info.ttl_ms = ttl_ms;
    entry.info.duration_ms = duration_ms;
    entry
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn entry_roundtrip_and_usage_count() {
    let shared = shared();
    let entry = entry("k1", 60_000, 10);
    shared.put_entry(&entry).await.unwrap();

    let loaded = shared.get_entry("k1").await.unwrap().unwrap();
    assert_eq!(loaded.data, entry.data);
    assert_eq!(loaded.info.checksum, entry.info.checksum);
    assert_eq!(loaded.info.source, "test-source");

    // the read above bumps the counter asynchronously
    let shared2 = Arc::clone(&shared);
    assert!(
        eventually(|| {
            let shared = Arc::clone(&shared2);
            async move {
                shared
                    .touch_info("k1")
                    .await
                    .unwrap()
                    .is_some_and(|info| info.count >= 1)
            }
        })
        .await
    );
}

#[tokio::test]
async fn miss_on_absent_key() {
    let shared = shared();
    assert!(shared.get_entry("nope").await.unwrap().is_none());
    assert!(shared.touch_info("nope").await.unwrap().is_none());
    assert!(!shared.has_data("nope").await.unwrap());
}

#[tokio::test]
async fn fast_entries_get_no_exp_marker() {
    let shared = shared();
    // below refresh_duration (200ms default)
    let fast = entry("fast", 60_000, 10);
    shared.put_entry(&fast).await.unwrap();
    assert!(!shared.backend().exists(&keys::exp_key("fast")).await.unwrap());

    let slow = entry("slow", 60_000, 400);
    shared.put_entry(&slow).await.unwrap();
    assert!(shared.backend().exists(&keys::exp_key("slow")).await.unwrap());
}

#[tokio::test]
async fn non_refreshable_entries_get_no_exp_marker() {
    let shared = shared();
    let mut plain = entry("plain", 60_000, 400);
    plain.info.source = String::new();
    shared.put_entry(&plain).await.unwrap();
    assert!(!shared.backend().exists(&keys::exp_key("plain")).await.unwrap());
}

#[tokio::test]
async fn dependencies_register_after_debounce() {
    let shared = shared();
    let mut e = entry("k1", 60_000, 10);
    e.dependent_keys = vec!["dep-a".to_string(), "dep-b".to_string()];
    shared.put_entry(&e).await.unwrap();

    // not yet visible inside the debounce window
    assert!(shared.dependents("dep-a").await.unwrap().is_empty());

    let shared2 = Arc::clone(&shared);
    assert!(
        eventually(|| {
            let shared = Arc::clone(&shared2);
            async move {
                shared.dependents("dep-a").await.unwrap() == vec!["k1".to_string()]
                    && shared.dependents("dep-b").await.unwrap() == vec!["k1".to_string()]
            }
        })
        .await
    );
}

#[tokio::test]
async fn delete_with_suppression_masks_expiry() {
    let shared = shared();
    let e = entry("k1", 60_000, 400);
    shared.put_entry(&e).await.unwrap();
    let raw = keys::exp_key("k1");

    shared.delete("k1", true).await.unwrap();
    assert!(!shared.has_data("k1").await.unwrap());
    // the racing notification for the deleted marker is suppressed
    assert_eq!(shared.confirm_expired(&raw).await.unwrap(), None);
    // metadata survives for future refresh
    assert!(shared.touch_info("k1").await.unwrap().is_some());
}

#[tokio::test]
async fn confirm_expired_accepts_genuine_expiry() {
    let shared = shared();
    // no record, no suppression: a genuine expiry
    assert_eq!(
        shared.confirm_expired(&keys::exp_key("gone")).await.unwrap(),
        Some("gone".to_string())
    );
    // wrong namespace is ignored
    assert_eq!(shared.confirm_expired("DATA::gone").await.unwrap(), None);
    assert_eq!(shared.confirm_expired("garbage").await.unwrap(), None);
}

#[tokio::test]
async fn delete_all_drops_info_too() {
    let shared = shared();
    shared.put_entry(&entry("k1", 60_000, 10)).await.unwrap();
    shared.delete_all("k1").await.unwrap();
    assert!(shared.touch_info("k1").await.unwrap().is_none());
}
