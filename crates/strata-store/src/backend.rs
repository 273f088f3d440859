//! The store backend seam.
//!
//! The engine talks to its shared store exclusively through [`StoreBackend`],
//! a small set of key-value, counter, set and pub/sub operations plus an
//! atomic [`Batch`]. Backends must be thread-safe (`Send + Sync`); the
//! redis and in-memory implementations live in their own crates.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// One write in an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Set a binary value, optionally with a TTL.
    SetBytes {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Set fields on a hash record (created if absent).
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Add a member to a set record (created if absent).
    SetAdd { key: String, member: String },
    /// (Re)set a record's TTL; no-op when the record is absent.
    Expire { key: String, ttl: Duration },
    /// Remove a record.
    Delete { key: String },
}

/// An ordered group of writes applied atomically.
///
/// Backends must guarantee that either every op is visible or none is; the
/// cache-entry invariant "never partially written" rests on this.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bytes(mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        self.ops.push(BatchOp::SetBytes { key: key.into(), value, ttl });
        self
    }

    pub fn hash_set(mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        self.ops.push(BatchOp::HashSet { key: key.into(), fields });
        self
    }

    pub fn set_add(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::SetAdd { key: key.into(), member: member.into() });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(BatchOp::Expire { key: key.into(), ttl });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A pub/sub subscription. Dropping it ends the subscription.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next message payload; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// A stream of expired record keys. Dropping it ends the watch.
pub struct KeyEvents {
    rx: mpsc::Receiver<String>,
}

impl KeyEvents {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next expired key; `None` once the watch has ended.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Multi-writer shared store with native key expiry and pub/sub.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Read a binary value. `None` when absent or expired.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read all fields of a hash record; empty map when absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Read a hash record and a binary value in one atomic step.
    ///
    /// Entry reads need a consistent (metadata, data) pair; two separate
    /// reads could straddle a concurrent rewrite.
    async fn read_pair(
        &self,
        hash_key: &str,
        bytes_key: &str,
    ) -> Result<(HashMap<String, String>, Option<Vec<u8>>)>;

    /// Increment an integer value, creating it at 1.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Increment an integer hash field, creating it at `delta`.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Whether a record exists (and has not expired).
    async fn exists(&self, key: &str) -> Result<bool>;

    /// (Re)set a record's TTL. Returns false when the record is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// All members of a set record; empty when absent.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Remove records; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Apply a batch of writes atomically.
    async fn apply(&self, batch: Batch) -> Result<()>;

    /// Publish a message on a channel.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Watch native expiry events for keys under `prefix`.
    ///
    /// Events are advisory: a key may be reported after it was explicitly
    /// deleted, and delivery timing depends on the backend's expiry cycle.
    /// Consumers must verify candidates against the live store.
    async fn watch_expired(&self, prefix: &str) -> Result<KeyEvents>;

    /// Stop background work and release connections.
    async fn close(&self);

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}
