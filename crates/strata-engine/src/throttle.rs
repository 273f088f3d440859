//! Sliding-window rate limiter on the cache primitives.
//!
//! The window is stepped: requests land in fixed-width time buckets whose
//! counters live in the shared store with TTL = window width. The only
//! synchronous work on the request path is a local block-marker lookup;
//! counting happens on a fire-and-forget task. The request that crosses the
//! threshold is itself never blocked; blocking starts with the next
//! request that sees the marker.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use strata_core::{checksum, now_ms, RateLimitRule};
use strata_store::{keys, LocalCache, StoreBackend};

/// Reduces a request target to the identity rate limits apply to.
///
/// Returning `None` exempts the target (an allow-listed caller). Reducing
/// to a coarser value (an IP without its path, a path prefix) groups
/// requests into one budget.
pub trait Signer: Send + Sync {
    fn signature(&self, target: &Value) -> Option<Value>;
}

/// Uses the whole target as the signature.
pub struct IdentitySigner;

impl Signer for IdentitySigner {
    fn signature(&self, target: &Value) -> Option<Value> {
        Some(target.clone())
    }
}

pub struct RateLimiter {
    backend: Arc<dyn StoreBackend>,
    local: Arc<LocalCache>,
    signer: Arc<dyn Signer>,
    rules: ArcSwap<Vec<RateLimitRule>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl RateLimiter {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        local: Arc<LocalCache>,
        signer: Arc<dyn Signer>,
        rules: Vec<RateLimitRule>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            local,
            signer,
            rules: ArcSwap::from_pointee(rules),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Swap the active rule set. Existing block markers keep blocking until
    /// they expire.
    pub fn apply_rules(&self, rules: Vec<RateLimitRule>) {
        self.rules.store(Arc::new(rules));
    }

    pub fn rules(&self) -> Vec<RateLimitRule> {
        self.rules.load_full().as_ref().clone()
    }

    /// Whether the target is currently blocked. Always counts the request
    /// against every configured window, off the critical path.
    pub fn is_throttled(&self, target: &Value) -> bool {
        let rules = self.rules.load_full();
        if rules.is_empty() {
            return false;
        }
        let Some(signature) = self.signer.signature(target) else {
            return false;
        };

        let mut blocked = false;
        let mut pending = Vec::with_capacity(rules.len());
        for rule in rules.iter() {
            let marker_key = checksum(&json!({
                "window_secs": rule.window_secs,
                "signature": signature,
            }));
            if self.local.has(&marker_key) {
                blocked = true;
            }
            pending.push((marker_key, rule.clone()));
        }
        self.spawn_count(pending);
        blocked
    }

    /// Cancel in-flight counting tasks.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn spawn_count(&self, pending: Vec<(String, RateLimitRule)>) {
        if self.tasks.is_closed() {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let local = Arc::clone(&self.local);
        let token = self.cancel.clone();
        self.tasks.spawn(async move {
            if token.is_cancelled() {
                return;
            }
            let now_secs = now_ms() / 1000;
            for (marker_key, rule) in pending {
                if rule.window_secs == 0 {
                    continue;
                }
                let bucket = now_secs / rule.window_secs as i64;
                let bucket_key = checksum(&json!({ "key": marker_key, "time": bucket }));
                let counter_key = keys::throttle_key(&bucket_key);
                match backend.incr(&counter_key).await {
                    Ok(1) => {
                        // first hit opens the bucket
                        if let Err(err) = backend
                            .expire(&counter_key, Duration::from_secs(rule.window_secs))
                            .await
                        {
                            tracing::warn!(error = %err, "could not arm throttle bucket TTL");
                        }
                    }
                    Ok(count) if count >= rule.max_count as i64 => {
                        local.put_value(
                            marker_key.clone(),
                            json!(count),
                            Duration::from_secs(rule.effective_block_secs()),
                        );
                        tracing::debug!(
                            window_secs = rule.window_secs,
                            count,
                            "rate limit crossed, block marker set"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "throttle counter update failed");
                    }
                }
            }
        });
    }
}
