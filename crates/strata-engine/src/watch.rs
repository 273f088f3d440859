//! The leader's expiry watcher.
//!
//! Listens to the store's native expiry notifications restricted to the
//! `EXP::` marker namespace, double-checks each candidate against the live
//! store (the notification may be stale, or suppressed by an explicit
//! delete), and feeds the survivors to the refresh queue.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use strata_store::{keys, SharedCache};

use crate::error::Result;
use crate::refresh::RefreshQueue;

pub struct ExpiryWatcher {
    shared: Arc<SharedCache>,
    queue: Arc<RefreshQueue>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ExpiryWatcher {
    pub fn new(shared: Arc<SharedCache>, queue: Arc<RefreshQueue>) -> Arc<Self> {
        Arc::new(Self { shared, queue, worker: Mutex::new(None) })
    }

    /// Subscribe to expiry events and start forwarding. Idempotent while
    /// running.
    pub async fn start(&self) -> Result<()> {
        if self.worker.lock().is_some() {
            return Ok(());
        }
        let mut events = self.shared.backend().watch_expired(&keys::exp_prefix()).await?;
        let shared = Arc::clone(&self.shared);
        let queue = Arc::clone(&self.queue);
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(raw_key) => match shared.confirm_expired(&raw_key).await {
                            Ok(Some(key)) => {
                                tracing::debug!(key = %key, "entry expired, queueing refresh");
                                queue.push(vec![key]).await;
                            }
                            Ok(None) => {}
                            Err(err) => {
                                tracing::warn!(raw_key = %raw_key, error = %err, "could not verify expiry");
                            }
                        },
                        None => {
                            tracing::warn!("expiry event stream ended");
                            break;
                        }
                    },
                }
            }
        });
        *self.worker.lock() = Some((token, handle));
        Ok(())
    }

    /// Unsubscribe and stop forwarding.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some((token, handle)) = worker {
            token.cancel();
            let _ = handle.await;
        }
    }
}
