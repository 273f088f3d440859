//! Rate limiter behavior: monotonic blocking, overshoot tolerance,
//! unblocking after the block window, and signer exemption.

mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use strata_core::{LocalCacheOptions, RateLimitRule};
use strata_engine::{IdentitySigner, RateLimiter, Signer};
use strata_store::{LocalCache, StoreBackend};
use strata_store_memory::MemoryBackend;

use support::init_tracing;

struct ExemptEveryone;

impl Signer for ExemptEveryone {
    fn signature(&self, _target: &Value) -> Option<Value> {
        None
    }
}

fn local_cache() -> Arc<LocalCache> {
    LocalCache::new(LocalCacheOptions {
        max_size: 1024,
        default_ttl_ms: 300_000,
        timer_interval_ms: 30_000,
    })
}

#[tokio::test]
async fn blocking_is_monotonic_and_lifts_after_block_secs() {
    init_tracing();
    let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
    let local = local_cache();
    let limiter = RateLimiter::new(
        backend.clone(),
        local,
        Arc::new(IdentitySigner),
        vec![RateLimitRule { window_secs: 2, max_count: 3, block_secs: Some(1) }],
    );
    let target = json!({"ip": "10.0.0.9"});

    // counting is asynchronous, so poll until the block marker appears;
    // at least max_count requests must pass unblocked before it can
    let mut unblocked_calls = 0usize;
    loop {
        if limiter.is_throttled(&target) {
            break;
        }
        unblocked_calls += 1;
        assert!(unblocked_calls < 100, "limiter never started blocking");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(unblocked_calls >= 3, "blocked before max_count was reached");

    // still blocked inside the window, no store round trip needed
    assert!(limiter.is_throttled(&target));

    // after block_secs of silence the marker is gone and the next request
    // passes (it is the one that starts the next count)
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert!(!limiter.is_throttled(&target));

    limiter.stop().await;
    backend.close().await;
}

#[tokio::test]
async fn distinct_signatures_have_distinct_budgets() {
    init_tracing();
    let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
    let local = local_cache();
    let limiter = RateLimiter::new(
        backend.clone(),
        local,
        Arc::new(IdentitySigner),
        vec![RateLimitRule { window_secs: 2, max_count: 2, block_secs: Some(2) }],
    );

    let noisy = json!({"ip": "10.0.0.1"});
    let mut calls = 0usize;
    loop {
        if limiter.is_throttled(&noisy) {
            break;
        }
        calls += 1;
        assert!(calls < 100);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // an unrelated caller is not affected
    assert!(!limiter.is_throttled(&json!({"ip": "10.0.0.2"})));

    limiter.stop().await;
    backend.close().await;
}

#[tokio::test]
async fn nil_signature_exempts_the_target() {
    init_tracing();
    let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
    let local = local_cache();
    let limiter = RateLimiter::new(
        backend.clone(),
        local,
        Arc::new(ExemptEveryone),
        vec![RateLimitRule { window_secs: 1, max_count: 1, block_secs: Some(60) }],
    );

    let target = json!({"ip": "10.0.0.3"});
    for _ in 0..20 {
        assert!(!limiter.is_throttled(&target));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!limiter.is_throttled(&target));

    limiter.stop().await;
    backend.close().await;
}

#[tokio::test]
async fn rules_can_be_swapped_at_runtime() {
    init_tracing();
    let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
    let local = local_cache();
    let limiter =
        RateLimiter::new(backend.clone(), local, Arc::new(IdentitySigner), Vec::new());

    // no rules: nothing is ever throttled
    let target = json!({"ip": "10.0.0.4"});
    assert!(!limiter.is_throttled(&target));

    limiter.apply_rules(vec![RateLimitRule::new(2, 2)]);
    assert_eq!(limiter.rules().len(), 1);
    assert_eq!(limiter.rules()[0].effective_block_secs(), 20);

    limiter.stop().await;
    backend.close().await;
}
