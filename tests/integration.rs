//! Integration Tests for the drain engine
//!
//! These tests need a real Redis; it is started with testcontainers, so no
//! docker-compose is required. The durable side is a SQLite file.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker)
//! cargo test --test integration -- --ignored
//!
//! # Run only ledger protocol tests
//! cargo test --test integration ledger -- --ignored
//! ```
//!
//! # Test Organization
//! - `ledger_*` - Redis ledger scripts: ordering, revision checks, TTL
//! - `happy_*` - Full drain from Redis into SQL
//! - `failure_*` - Corrupt records and unreachable backends

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

use dirty_drain::{
    DirtyLedger, DocumentStore, EngineState, Location, ReadOptions, RedisLedger,
    SqlDocumentStore, StorageError, SyncConfig, SyncEngine, WriteThrough,
};

// =============================================================================
// Helpers
// =============================================================================

/// Create a Redis container with health check
fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn redis_url(container: &Container<'_, GenericImage>) -> String {
    format!("redis://127.0.0.1:{}", container.get_host_port_ipv4(6379))
}

fn unique_prefix() -> String {
    format!("test:{}:", uuid::Uuid::new_v4())
}

fn unique_sqlite_url(name: &str) -> (String, String) {
    let path = std::env::temp_dir()
        .join(format!("dirty_drain_it_{}_{}.db", name, uuid::Uuid::new_v4()))
        .display()
        .to_string();
    (format!("sqlite://{}?mode=rwc", path), path)
}

fn cleanup_db(path: &str) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{}-wal", path));
    let _ = std::fs::remove_file(format!("{}-shm", path));
}

const TTL: Duration = Duration::from_secs(3600);

// =============================================================================
// Ledger Protocol Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn ledger_peek_returns_oldest_without_mutating() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let ledger = RedisLedger::with_prefix(&redis_url(&redis), Some(&unique_prefix())).await.unwrap();

    assert!(ledger.peek_first().await.unwrap().is_none());

    assert_eq!(ledger.set("b", b"1").await.unwrap(), 1);
    assert_eq!(ledger.set("a", b"1").await.unwrap(), 1);
    assert_eq!(ledger.set("b", b"2").await.unwrap(), 2);

    let first = ledger.peek_first().await.unwrap().unwrap();
    assert_eq!(first.key, "b");
    assert_eq!(first.revision, 2);
    assert_eq!(first.value, b"2".to_vec());
    assert_eq!(ledger.peek_first().await.unwrap().unwrap(), first);
    assert_eq!(ledger.pending().await.unwrap(), 2);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn ledger_advance_acknowledges_matching_revision() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let ledger = RedisLedger::with_prefix(&redis_url(&redis), Some(&unique_prefix())).await.unwrap();

    ledger.set("a", b"v").await.unwrap();
    ledger.set("b", b"v").await.unwrap();
    assert_eq!(ledger.ttl("a").await.unwrap(), None);

    let next = ledger.advance("a", 1, TTL).await.unwrap().unwrap();
    assert_eq!(next.key, "b");

    let ttl = ledger.ttl("a").await.unwrap().unwrap();
    assert!(ttl <= TTL && ttl > TTL - Duration::from_secs(60));
    assert_eq!(ledger.pending().await.unwrap(), 1);

    // Record is still readable while volatile
    let value = ledger.get("a", &ReadOptions::default()).await.unwrap();
    assert_eq!(value, Some(b"v".to_vec()));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn ledger_stale_advance_keeps_key_dirty() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let ledger = RedisLedger::with_prefix(&redis_url(&redis), Some(&unique_prefix())).await.unwrap();

    ledger.set("a", b"v1").await.unwrap();
    ledger.set("b", b"v1").await.unwrap();
    ledger.set("a", b"v2").await.unwrap();

    let next = ledger.advance("a", 1, TTL).await.unwrap().unwrap();
    assert_eq!(next.key, "a");
    assert_eq!(next.revision, 2);
    assert_eq!(ledger.ttl("a").await.unwrap(), None);
    assert_eq!(ledger.pending().await.unwrap(), 2);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn ledger_rewrite_after_ack_clears_ttl_and_redirties() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let ledger = RedisLedger::with_prefix(&redis_url(&redis), Some(&unique_prefix())).await.unwrap();

    ledger.set("a", b"v1").await.unwrap();
    assert!(ledger.advance("a", 1, TTL).await.unwrap().is_none());
    assert!(ledger.ttl("a").await.unwrap().is_some());

    assert_eq!(ledger.set("a", b"v2").await.unwrap(), 2);
    assert_eq!(ledger.ttl("a").await.unwrap(), None);
    assert_eq!(ledger.peek_first().await.unwrap().unwrap().revision, 2);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn ledger_evicted_dirty_key_is_dropped() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let prefix = unique_prefix();
    let ledger = RedisLedger::with_prefix(&redis_url(&redis), Some(&prefix)).await.unwrap();

    ledger.set("gone", b"v").await.unwrap();
    ledger.set("kept", b"v").await.unwrap();

    let mut conn = ledger.connection();
    let _: () = conn.del(format!("{}gone", prefix)).await.unwrap();

    let head = ledger.peek_first().await.unwrap().unwrap();
    assert_eq!(head.key, "kept");
    assert_eq!(ledger.pending().await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn ledger_create_on_miss_seeds_once() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let ledger = RedisLedger::with_prefix(&redis_url(&redis), Some(&unique_prefix())).await.unwrap();

    let options = ReadOptions::create_on_miss(b"{}".to_vec());
    assert_eq!(ledger.get("a", &options).await.unwrap(), Some(b"{}".to_vec()));
    assert_eq!(ledger.get("a", &options).await.unwrap(), Some(b"{}".to_vec()));

    let head = ledger.peek_first().await.unwrap().unwrap();
    assert_eq!(head.revision, 1);
    assert!(ledger.get("missing", &ReadOptions::default()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn ledger_write_over_corrupt_record_is_decode_error() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let prefix = unique_prefix();
    let ledger = RedisLedger::with_prefix(&redis_url(&redis), Some(&prefix)).await.unwrap();

    let mut conn = ledger.connection();
    let _: () = conn.set(format!("{}short", prefix), vec![1u8, 2, 3]).await.unwrap();
    let _: () = conn.set(format!("{}zero", prefix), vec![0u8; 8]).await.unwrap();

    let err = ledger.set("short", b"v").await.unwrap_err();
    assert!(matches!(err, StorageError::Decode { .. }), "{err:?}");
    assert!(!err.is_transient());

    let err = ledger.set("zero", b"v").await.unwrap_err();
    assert!(matches!(err, StorageError::Decode { .. }), "{err:?}");

    // Nothing was rewritten or marked dirty
    let record: Vec<u8> = conn.get(format!("{}zero", prefix)).await.unwrap();
    assert_eq!(record, vec![0u8; 8]);
    assert_eq!(ledger.pending().await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn ledger_quarantine_skips_repaired_record() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let prefix = unique_prefix();
    let ledger = RedisLedger::with_prefix(&redis_url(&redis), Some(&prefix)).await.unwrap();

    ledger.set("k", b"v1").await.unwrap();
    let mut conn = ledger.connection();
    let _: () = conn.set(format!("{}k", prefix), vec![0u8; 8]).await.unwrap();
    assert!(matches!(ledger.peek_first().await, Err(StorageError::Decode { .. })));

    // Repaired between the failed decode and the quarantine call
    let repaired = dirty_drain::dirty_entry::encode_record(5, b"fixed");
    let _: () = conn.set(format!("{}k", prefix), repaired).await.unwrap();
    assert!(!ledger.quarantine("k").await.unwrap());

    assert!(ledger.quarantined().await.unwrap().is_empty());
    let head = ledger.peek_first().await.unwrap().unwrap();
    assert_eq!(head.key, "k");
    assert_eq!(head.revision, 5);

    // Still corrupt: moved aside
    let _: () = conn.set(format!("{}k", prefix), vec![1u8, 2]).await.unwrap();
    assert!(ledger.quarantine("k").await.unwrap());
    assert_eq!(ledger.quarantined().await.unwrap(), vec!["k".to_string()]);
    assert_eq!(ledger.pending().await.unwrap(), 0);
}

// =============================================================================
// Full Drain Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_drain_redis_into_sqlite() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let (sql_url, db_path) = unique_sqlite_url("drain");

    let config = SyncConfig {
        redis_url: Some(redis_url(&redis)),
        redis_prefix: Some(unique_prefix()),
        sql_url: Some(sql_url),
        volatile_ttl_secs: 600,
        idle_backoff_ms: 20,
        ..Default::default()
    };
    let writer = RedisLedger::with_prefix(
        config.redis_url.as_deref().unwrap(),
        config.redis_prefix.as_deref(),
    )
    .await
    .unwrap();

    for i in 0..25 {
        writer.set(&format!("db:users:{i}"), format!("v{i}").as_bytes()).await.unwrap();
    }
    writer.set("db:users:0", b"latest").await.unwrap();

    let engine = Arc::new(SyncEngine::connect(config.clone()).await.unwrap());
    let handle = engine.clone().spawn();

    tokio::time::timeout(Duration::from_secs(30), async {
        while writer.pending().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("ledger did not drain");

    engine.stop();
    handle.await.unwrap().unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);

    let store = SqlDocumentStore::new(config.sql_url.as_deref().unwrap()).await.unwrap();
    assert_eq!(store.count(Some("db")).await.unwrap(), 25);

    let doc = store.load(&Location::new("db", "users", "0")).await.unwrap().unwrap();
    assert_eq!(doc.revision, 2);
    assert_eq!(doc.value, b"latest".to_vec());

    let ttl = writer.ttl("db:users:7").await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(600));

    cleanup_db(&db_path);
}

// =============================================================================
// Failure Scenario Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn failure_corrupt_redis_record_is_quarantined() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let prefix = unique_prefix();
    let (sql_url, db_path) = unique_sqlite_url("corrupt");

    let ledger = Arc::new(RedisLedger::with_prefix(&redis_url(&redis), Some(&prefix)).await.unwrap());
    ledger.set("db:c:bad", b"v").await.unwrap();
    ledger.set("db:c:good", b"v").await.unwrap();

    // Overwrite the record behind the ledger's back, leaving it dirty
    let mut conn = ledger.connection();
    let _: () = conn.set(format!("{}db:c:bad", prefix), vec![1u8, 2, 3]).await.unwrap();

    let store = Arc::new(SqlDocumentStore::new(&sql_url).await.unwrap());
    let config = SyncConfig { idle_backoff_ms: 20, ..Default::default() };
    let engine = Arc::new(SyncEngine::new(ledger.clone(), store.clone(), config));
    let handle = engine.clone().spawn();

    tokio::time::timeout(Duration::from_secs(30), async {
        while ledger.pending().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("ledger did not drain");
    engine.stop();
    handle.await.unwrap().unwrap();

    assert_eq!(ledger.quarantined().await.unwrap(), vec!["db:c:bad".to_string()]);
    assert!(store.load(&Location::new("db", "c", "good")).await.unwrap().is_some());
    assert!(store.load(&Location::new("db", "c", "bad")).await.unwrap().is_none());
    assert_eq!(engine.stats().quarantined, 1);

    cleanup_db(&db_path);
}

#[tokio::test]
#[ignore] // Retries with the startup policy before failing
async fn failure_unreachable_redis_fails_connect() {
    let (sql_url, db_path) = unique_sqlite_url("unreachable");
    let config = SyncConfig {
        redis_url: Some("redis://127.0.0.1:1".into()),
        sql_url: Some(sql_url),
        ..Default::default()
    };

    let result = SyncEngine::connect(config).await;
    assert!(matches!(result, Err(StorageError::Backend(_))));

    cleanup_db(&db_path);
}
