//! Redis [`StoreBackend`] implementation.
//!
//! Commands run over a deadpool connection pool; subscriptions use
//! dedicated client connections because `SUBSCRIBE` takes a connection out
//! of command mode. Atomic batches are `MULTI`/`EXEC` pipelines. Expiry
//! notifications ride the keyspace-event channel
//! (`__keyevent@<db>__:expired`), which requires
//! `notify-keyspace-events Ex` on the server; the backend attempts to set
//! it itself and logs when it cannot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use strata_store::backend::{Batch, BatchOp, KeyEvents, StoreBackend, Subscription};
use strata_store::error::{Result, StoreError};

const CHANNEL_CAPACITY: usize = 1024;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// The keyspace-event channel carrying expirations for one database.
fn keyevent_channel(db: i64) -> String {
    format!("__keyevent@{db}__:expired")
}

fn ttl_ms(ttl: Duration) -> i64 {
    (ttl.as_millis() as i64).max(1)
}

/// Redis-backed shared store.
#[derive(Debug)]
pub struct RedisBackend {
    pool: Pool,
    client: redis::Client,
    db: i64,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl RedisBackend {
    /// Connect and validate the server is reachable.
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let client =
            redis::Client::open(url).map_err(|err| StoreError::connection(err.to_string()))?;
        let db = client.get_connection_info().redis.db;
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| StoreError::pool(err.to_string()))?;

        let mut conn = pool.get().await.map_err(|err| StoreError::pool(err.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| StoreError::connection(err.to_string()))?;

        Ok(Arc::new(Self {
            pool,
            client,
            db,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Closed);
        }
        self.pool.get().await.map_err(|err| StoreError::pool(err.to_string()))
    }

    async fn open_pubsub(client: &redis::Client, channel: &str) -> Result<redis::aio::PubSub> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|err| StoreError::subscribe(err.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|err| StoreError::subscribe(err.to_string()))?;
        Ok(pubsub)
    }

    /// Pump messages from a pub/sub connection into `tx`, reconnecting with
    /// exponential backoff until cancelled or the receiver goes away.
    fn spawn_pubsub_pump(
        &self,
        channel: String,
        initial: redis::aio::PubSub,
        tx: mpsc::Sender<Vec<u8>>,
    ) {
        let client = self.client.clone();
        let token = self.cancel.clone();
        self.tasks.spawn(async move {
            let mut pubsub = Some(initial);
            let mut backoff = INITIAL_BACKOFF;
            loop {
                let mut active = match pubsub.take() {
                    Some(active) => active,
                    None => match Self::open_pubsub(&client, &channel).await {
                        Ok(active) => {
                            backoff = INITIAL_BACKOFF;
                            active
                        }
                        Err(err) => {
                            tracing::error!(
                                channel = %channel,
                                error = %err,
                                backoff_secs = backoff.as_secs(),
                                "pub/sub connection lost, reconnecting"
                            );
                            tokio::select! {
                                _ = token.cancelled() => return,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                            continue;
                        }
                    },
                };
                let mut stream = active.on_message();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        message = stream.next() => match message {
                            Some(message) => {
                                let payload = message.get_payload_bytes().to_vec();
                                if tx.send(payload).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                tracing::warn!(channel = %channel, "pub/sub stream ended");
                                break;
                            }
                        },
                    }
                }
            }
        });
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(|err| StoreError::command(err.to_string()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        conn.hgetall(key).await.map_err(|err| StoreError::command(err.to_string()))
    }

    async fn read_pair(
        &self,
        hash_key: &str,
        bytes_key: &str,
    ) -> Result<(HashMap<String, String>, Option<Vec<u8>>)> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .hgetall(hash_key)
            .get(bytes_key)
            .query_async(&mut conn)
            .await
            .map_err(|err| StoreError::command(err.to_string()))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        conn.incr(key, 1).await.map_err(|err| StoreError::command(err.to_string()))
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        conn.hincr(key, field, delta)
            .await
            .map_err(|err| StoreError::command(err.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists(key).await.map_err(|err| StoreError::command(err.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|err| StoreError::command(err.to_string()))?;
        Ok(updated == 1)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.smembers(key).await.map_err(|err| StoreError::command(err.to_string()))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        conn.del(keys).await.map_err(|err| StoreError::command(err.to_string()))
    }

    async fn apply(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops {
            match op {
                BatchOp::SetBytes { key, value, ttl } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl {
                        cmd.arg("PX").arg(ttl_ms(ttl));
                    }
                    cmd.ignore();
                }
                BatchOp::HashSet { key, fields } => {
                    let cmd = pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
                BatchOp::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                BatchOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl_ms(ttl)).ignore();
                }
                BatchOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|err| StoreError::command(err.to_string()))
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.publish(channel, payload)
            .await
            .map_err(|err| StoreError::command(err.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Closed);
        }
        let pubsub = Self::open_pubsub(&self.client, channel).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.spawn_pubsub_pump(channel.to_string(), pubsub, tx);
        Ok(Subscription::new(rx))
    }

    async fn watch_expired(&self, prefix: &str) -> Result<KeyEvents> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Closed);
        }
        // best effort: managed servers often lock CONFIG down
        match self.conn().await {
            Ok(mut conn) => {
                let enabled: std::result::Result<(), redis::RedisError> = redis::cmd("CONFIG")
                    .arg("SET")
                    .arg("notify-keyspace-events")
                    .arg("Ex")
                    .query_async(&mut conn)
                    .await;
                if let Err(err) = enabled {
                    tracing::warn!(
                        error = %err,
                        "could not enable keyspace notifications, expecting server-side config"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not check keyspace notification config");
            }
        }

        let channel = keyevent_channel(self.db);
        let pubsub = Self::open_pubsub(&self.client, &channel).await?;
        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        self.spawn_pubsub_pump(channel, pubsub, raw_tx);

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let prefix = prefix.to_string();
        let token = self.cancel.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    payload = raw_rx.recv() => match payload {
                        Some(payload) => {
                            let Ok(key) = String::from_utf8(payload) else {
                                continue;
                            };
                            if key.starts_with(&prefix) && tx.send(key).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(KeyEvents::new(rx))
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
