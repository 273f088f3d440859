//! Integration tests against a live redis server.
//!
//! Ignored by default; run with a server available:
//! `REDIS_URL=redis://127.0.0.1/0 cargo test -p strata-store-redis -- --ignored`

use std::time::Duration;

use strata_store::backend::{Batch, StoreBackend};
use strata_store_redis::RedisBackend;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/0".to_string())
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn batch_roundtrip() {
    let backend = RedisBackend::connect(&redis_url()).await.unwrap();
    let batch = Batch::new()
        .set_bytes("strata-test::data", b"payload".to_vec(), Some(Duration::from_secs(5)))
        .hash_set(
            "strata-test::info",
            vec![("checksum".into(), "abc".into()), ("ttl_ms".into(), "5000".into())],
        )
        .expire("strata-test::info", Duration::from_secs(5));
    backend.apply(batch).await.unwrap();

    let (fields, bytes) = backend
        .read_pair("strata-test::info", "strata-test::data")
        .await
        .unwrap();
    assert_eq!(bytes.as_deref(), Some(b"payload".as_slice()));
    assert_eq!(fields.get("checksum").map(String::as_str), Some("abc"));

    backend
        .delete(&["strata-test::data".to_string(), "strata-test::info".to_string()])
        .await
        .unwrap();
    backend.close().await;
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn pubsub_delivers_across_connections() {
    let backend = RedisBackend::connect(&redis_url()).await.unwrap();
    let mut sub = backend.subscribe("strata-test::chan").await.unwrap();
    // subscription is established before publish returns a subscriber count
    tokio::time::sleep(Duration::from_millis(100)).await;
    backend
        .publish("strata-test::chan", b"ping".to_vec())
        .await
        .unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("message within deadline");
    assert_eq!(message.as_deref(), Some(b"ping".as_slice()));
    backend.close().await;
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn expired_keys_are_notified() {
    let backend = RedisBackend::connect(&redis_url()).await.unwrap();
    let mut events = backend.watch_expired("strata-test-exp::").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let batch = Batch::new().set_bytes(
        "strata-test-exp::k1",
        b"1".to_vec(),
        Some(Duration::from_millis(300)),
    );
    backend.apply(batch).await.unwrap();

    let key = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("expiry event within deadline");
    assert_eq!(key.as_deref(), Some("strata-test-exp::k1"));
    backend.close().await;
}
