//! In-memory [`StoreBackend`] implementation.
//!
//! Backs single-instance deployments that have no redis to talk to, and
//! every hermetic test in the workspace. Semantics follow the redis
//! backend: records expire lazily on read and are reaped by a sweeper task
//! that emits the native expiry events `watch_expired` consumers rely on;
//! pub/sub is per-channel fan-out. Several engine instances sharing one
//! `MemoryBackend` see each other exactly like instances sharing one redis.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use strata_store::backend::{Batch, BatchOp, KeyEvents, StoreBackend, Subscription};
use strata_store::error::{Result, StoreError};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(50);
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum RecordValue {
    Bytes(Vec<u8>),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Record {
    value: RecordValue,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, at: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => at < expires_at,
            None => true,
        }
    }
}

/// Single-process store with TTLs, pub/sub and expiry notifications.
pub struct MemoryBackend {
    records: Mutex<HashMap<String, Record>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    expired_tx: broadcast::Sender<String>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl MemoryBackend {
    /// Create a backend and start its expiry sweeper.
    pub fn start() -> Arc<Self> {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(interval: Duration) -> Arc<Self> {
        let (expired_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let backend = Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            expired_tx,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        });
        Arc::clone(&backend).spawn_sweeper(interval);
        backend
    }

    fn spawn_sweeper(self: Arc<Self>, interval: Duration) {
        let backend = Arc::clone(&self);
        let token = self.cancel.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        for key in backend.reap_expired() {
                            let _ = backend.expired_tx.send(key);
                        }
                    }
                }
            }
        });
    }

    fn reap_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let expired: Vec<String> = records
            .iter()
            .filter(|(_, record)| !record.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            records.remove(key);
        }
        expired
    }

    fn channel_sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn apply_op(records: &mut HashMap<String, Record>, op: BatchOp, now: Instant) {
        match op {
            BatchOp::SetBytes { key, value, ttl } => {
                records.insert(
                    key,
                    Record {
                        value: RecordValue::Bytes(value),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
            }
            BatchOp::HashSet { key, fields } => {
                let record = records
                    .entry(key)
                    .and_modify(|record| {
                        if !record.is_live(now) {
                            record.value = RecordValue::Hash(HashMap::new());
                            record.expires_at = None;
                        }
                    })
                    .or_insert_with(|| Record {
                        value: RecordValue::Hash(HashMap::new()),
                        expires_at: None,
                    });
                if let RecordValue::Hash(map) = &mut record.value {
                    map.extend(fields);
                } else {
                    record.value = RecordValue::Hash(fields.into_iter().collect());
                }
            }
            BatchOp::SetAdd { key, member } => {
                let record = records
                    .entry(key)
                    .and_modify(|record| {
                        if !record.is_live(now) {
                            record.value = RecordValue::Set(BTreeSet::new());
                            record.expires_at = None;
                        }
                    })
                    .or_insert_with(|| Record {
                        value: RecordValue::Set(BTreeSet::new()),
                        expires_at: None,
                    });
                if let RecordValue::Set(set) = &mut record.value {
                    set.insert(member);
                } else {
                    record.value = RecordValue::Set(BTreeSet::from([member]));
                }
            }
            BatchOp::Expire { key, ttl } => {
                if let Some(record) = records.get_mut(&key) {
                    if record.is_live(now) {
                        record.expires_at = Some(now + ttl);
                    }
                }
            }
            BatchOp::Delete { key } => {
                records.remove(&key);
            }
        }
    }

    fn spawn_pump<T: Clone + Send + 'static>(
        &self,
        mut rx: broadcast::Receiver<T>,
        tx: mpsc::Sender<T>,
    ) {
        let token = self.cancel.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "memory backend subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let now = Instant::now();
        let records = self.records.lock();
        Ok(records.get(key).filter(|record| record.is_live(now)).and_then(
            |record| match &record.value {
                RecordValue::Bytes(bytes) => Some(bytes.clone()),
                _ => None,
            },
        ))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let records = self.records.lock();
        Ok(records
            .get(key)
            .filter(|record| record.is_live(now))
            .and_then(|record| match &record.value {
                RecordValue::Hash(map) => Some(map.clone()),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn read_pair(
        &self,
        hash_key: &str,
        bytes_key: &str,
    ) -> Result<(HashMap<String, String>, Option<Vec<u8>>)> {
        self.ensure_open()?;
        let now = Instant::now();
        let records = self.records.lock();
        let fields = records
            .get(hash_key)
            .filter(|record| record.is_live(now))
            .and_then(|record| match &record.value {
                RecordValue::Hash(map) => Some(map.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let bytes = records
            .get(bytes_key)
            .filter(|record| record.is_live(now))
            .and_then(|record| match &record.value {
                RecordValue::Bytes(bytes) => Some(bytes.clone()),
                _ => None,
            });
        Ok((fields, bytes))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut records = self.records.lock();
        match records.get_mut(key).filter(|record| record.is_live(now)) {
            Some(record) => {
                let RecordValue::Bytes(bytes) = &record.value else {
                    return Err(StoreError::command("INCR on non-string record"));
                };
                let current: i64 = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StoreError::command("value is not an integer"))?;
                let next = current + 1;
                record.value = RecordValue::Bytes(next.to_string().into_bytes());
                Ok(next)
            }
            None => {
                records.insert(
                    key.to_string(),
                    Record {
                        value: RecordValue::Bytes(b"1".to_vec()),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut records = self.records.lock();
        let record = records
            .entry(key.to_string())
            .and_modify(|record| {
                if !record.is_live(now) {
                    record.value = RecordValue::Hash(HashMap::new());
                    record.expires_at = None;
                }
            })
            .or_insert_with(|| Record {
                value: RecordValue::Hash(HashMap::new()),
                expires_at: None,
            });
        let RecordValue::Hash(map) = &mut record.value else {
            return Err(StoreError::command("HINCRBY on non-hash record"));
        };
        let current: i64 = map
            .get(field)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| StoreError::command("hash field is not an integer"))
            })
            .transpose()?
            .unwrap_or(0);
        let next = current + delta;
        map.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        Ok(self
            .records
            .lock()
            .get(key)
            .map(|record| record.is_live(now))
            .unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut records = self.records.lock();
        match records.get_mut(key).filter(|record| record.is_live(now)) {
            Some(record) => {
                record.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let now = Instant::now();
        Ok(self
            .records
            .lock()
            .get(key)
            .filter(|record| record.is_live(now))
            .and_then(|record| match &record.value {
                RecordValue::Set(set) => Some(set.iter().cloned().collect()),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut records = self.records.lock();
        let mut removed = 0;
        for key in keys {
            if let Some(record) = records.remove(key) {
                if record.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn apply(&self, batch: Batch) -> Result<()> {
        self.ensure_open()?;
        let now = Instant::now();
        // one lock across the whole batch is what makes it atomic here
        let mut records = self.records.lock();
        for op in batch.ops {
            Self::apply_op(&mut records, op, now);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        // no subscribers is fine, the message just goes nowhere
        let _ = self.channel_sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.ensure_open()?;
        let rx = self.channel_sender(channel).subscribe();
        let (tx, out) = mpsc::channel(CHANNEL_CAPACITY);
        self.spawn_pump(rx, tx);
        Ok(Subscription::new(out))
    }

    async fn watch_expired(&self, prefix: &str) -> Result<KeyEvents> {
        self.ensure_open()?;
        let mut rx = self.expired_tx.subscribe();
        let (tx, out) = mpsc::channel(CHANNEL_CAPACITY);
        let token = self.cancel.clone();
        let prefix = prefix.to_string();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(key) => {
                            if key.starts_with(&prefix) && tx.send(key).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "expiry watch lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(KeyEvents::new(out))
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.records.lock().clear();
        self.channels.lock().clear();
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_roundtrip_with_ttl() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
        let batch = Batch::new().set_bytes("k", b"v".to_vec(), Some(Duration::from_millis(40)));
        backend.apply(batch).await.unwrap();
        assert_eq!(backend.get_bytes("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(backend.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(backend.get_bytes("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
        backend.close().await;
    }

    #[tokio::test]
    async fn expired_keys_are_reported_by_prefix() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
        let mut events = backend.watch_expired("EXP::").await.unwrap();

        let batch = Batch::new()
            .set_bytes("EXP::a", b"1".to_vec(), Some(Duration::from_millis(30)))
            .set_bytes("DATA::a", b"x".to_vec(), Some(Duration::from_millis(30)))
            .set_bytes("EXP::keeper", b"1".to_vec(), None);
        backend.apply(batch).await.unwrap();

        let key = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("expiry event within deadline");
        assert_eq!(key.as_deref(), Some("EXP::a"));
        // the unexpired marker must not be reported
        assert!(backend.exists("EXP::keeper").await.unwrap());
        backend.close().await;
    }

    #[tokio::test]
    async fn counters_increment_and_expire() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
        assert_eq!(backend.incr("c").await.unwrap(), 1);
        assert_eq!(backend.incr("c").await.unwrap(), 2);
        assert!(backend.expire("c", Duration::from_millis(30)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(70)).await;
        // expired counter restarts from scratch
        assert_eq!(backend.incr("c").await.unwrap(), 1);
        backend.close().await;
    }

    #[tokio::test]
    async fn hash_fields_merge_and_increment() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
        let batch = Batch::new().hash_set("h", vec![("a".into(), "1".into())]);
        backend.apply(batch).await.unwrap();
        let batch = Batch::new().hash_set("h", vec![("b".into(), "2".into())]);
        backend.apply(batch).await.unwrap();

        let fields = backend.hash_get_all("h").await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(backend.hash_incr("h", "count", 1).await.unwrap(), 1);
        assert_eq!(backend.hash_incr("h", "count", 2).await.unwrap(), 3);
        backend.close().await;
    }

    #[tokio::test]
    async fn sets_collect_members() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
        let batch = Batch::new().set_add("s", "b").set_add("s", "a").set_add("s", "a");
        backend.apply(batch).await.unwrap();
        assert_eq!(backend.set_members("s").await.unwrap(), vec!["a", "b"]);
        backend.close().await;
    }

    #[tokio::test]
    async fn delete_counts_live_records() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
        backend
            .apply(Batch::new().set_bytes("a", b"1".to_vec(), None))
            .await
            .unwrap();
        let removed = backend
            .delete(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        backend.close().await;
    }

    #[tokio::test]
    async fn pubsub_fans_out_to_all_subscribers() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
        let mut sub1 = backend.subscribe("chan").await.unwrap();
        let mut sub2 = backend.subscribe("chan").await.unwrap();
        backend.publish("chan", b"hello".to_vec()).await.unwrap();

        for sub in [&mut sub1, &mut sub2] {
            let message = tokio::time::timeout(Duration::from_secs(1), sub.recv())
                .await
                .expect("message within deadline");
            assert_eq!(message.as_deref(), Some(b"hello".as_slice()));
        }
        backend.close().await;
    }

    #[tokio::test]
    async fn closed_backend_rejects_operations() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
        backend.close().await;
        assert!(matches!(
            backend.get_bytes("k").await.unwrap_err(),
            StoreError::Closed
        ));
    }
}
