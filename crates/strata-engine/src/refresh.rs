//! The leader's refresh queue.
//!
//! Candidates arrive from the expiry watcher and sit in a score-ordered
//! queue. Each tick refreshes the best-scoring fraction under both a batch
//! cap and a time budget, then trims the worst-scoring fraction so keys
//! that never make the cut cannot accumulate forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use strata_core::{now_ms, RefreshOptions};
use strata_store::SharedCache;

use crate::facade::TieredCache;

pub struct RefreshQueue {
    cache: Arc<TieredCache>,
    shared: Arc<SharedCache>,
    opts: RefreshOptions,
    queue: Mutex<HashMap<String, f64>>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RefreshQueue {
    pub fn new(cache: Arc<TieredCache>, shared: Arc<SharedCache>, opts: RefreshOptions) -> Arc<Self> {
        Arc::new(Self {
            cache,
            shared,
            opts,
            queue: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        })
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Merge candidates into the queue, scoring them from live metadata.
    /// Keys without metadata cannot be refreshed and are dropped here.
    pub async fn push(&self, keys: Vec<String>) {
        let at_ms = now_ms();
        for key in keys {
            let score = match self.shared.priority_score(&key, at_ms).await {
                Ok(Some(score)) => score,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "could not score refresh candidate");
                    continue;
                }
            };
            self.queue.lock().insert(key, score);
        }
        self.enforce_bound();
    }

    /// Start the tick loop. Idempotent while running.
    pub fn start(self: Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let queue = Arc::clone(&self);
        let token = CancellationToken::new();
        let tick_token = token.clone();
        let handle = tokio::spawn(async move {
            let interval = Duration::from_millis(queue.opts.refresh_interval_ms.max(1));
            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => queue.run_tick().await,
                }
            }
        });
        *worker = Some((token, handle));
    }

    /// Stop the tick loop; queued candidates survive for the next start.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some((token, handle)) = worker {
            token.cancel();
            let _ = handle.await;
        }
    }

    async fn run_tick(&self) {
        let started = Instant::now();
        let budget = Duration::from_millis(
            (self.opts.refresh_interval_ms as f64 * self.opts.time_ratio) as u64,
        );

        let selected = self.take_top_fraction();
        let mut refreshed = 0usize;
        for key in &selected {
            if started.elapsed() >= budget {
                tracing::debug!(
                    remaining = selected.len() - refreshed,
                    "refresh tick out of time budget"
                );
                break;
            }
            match self.cache.refresh(key).await {
                Ok(true) => refreshed += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(key = %key, error = %err, "background refresh failed"),
            }
        }
        let trimmed = self.trim_tail();
        if refreshed > 0 || trimmed > 0 {
            tracing::debug!(refreshed, trimmed, queued = self.len(), "refresh tick");
        }
    }

    /// Remove and return the best-scoring tick batch.
    fn take_top_fraction(&self) -> Vec<String> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Vec::new();
        }
        let take = ((queue.len() as f64 * self.opts.size_ratio).ceil() as usize)
            .clamp(1, self.opts.batch_size);
        let mut ordered: Vec<(String, f64)> =
            queue.iter().map(|(key, score)| (key.clone(), *score)).collect();
        ordered.sort_by(|a, b| b.1.total_cmp(&a.1));
        ordered.truncate(take);
        for (key, _) in &ordered {
            queue.remove(key);
        }
        ordered.into_iter().map(|(key, _)| key).collect()
    }

    /// Drop the worst-scoring fraction of what remains.
    fn trim_tail(&self) -> usize {
        let mut queue = self.queue.lock();
        let drop_count = (queue.len() as f64 * self.opts.remove_ratio) as usize;
        if drop_count == 0 {
            return 0;
        }
        let mut ordered: Vec<(String, f64)> =
            queue.iter().map(|(key, score)| (key.clone(), *score)).collect();
        ordered.sort_by(|a, b| a.1.total_cmp(&b.1));
        for (key, _) in ordered.into_iter().take(drop_count) {
            queue.remove(&key);
        }
        drop_count
    }

    /// Keep the queue under its size bound by evicting the lowest scores.
    fn enforce_bound(&self) {
        let mut queue = self.queue.lock();
        if queue.len() <= self.opts.max_queue_size {
            return;
        }
        let mut ordered: Vec<(String, f64)> =
            queue.drain().collect();
        ordered.sort_by(|a, b| b.1.total_cmp(&a.1));
        ordered.truncate(self.opts.max_queue_size);
        queue.extend(ordered);
    }
}
