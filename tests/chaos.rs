//! Chaos Testing for the drain engine
//!
//! Failure scenarios driven by wrapper backends:
//! 1. **FailingDocumentStore** - errors injected at specific save calls
//! 2. **FailingLedger** - errors injected into peek / advance, including
//!    malformed script replies
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use dirty_drain::dirty_entry::encode_record;
use dirty_drain::{
    DirtyEntry, DirtyLedger, DocumentStore, EngineState, InMemoryDocumentStore, InMemoryLedger,
    Location, StorageError, StoredDocument, SyncConfig, SyncEngine, WriteThrough,
};

// =============================================================================
// Failing Wrappers - Precise Error Injection
// =============================================================================

/// Which error a wrapper injects.
#[derive(Clone, Copy)]
enum Fault {
    Backend,
    Protocol,
}

impl Fault {
    fn error(self, op: &str) -> StorageError {
        match self {
            Fault::Backend => StorageError::Backend(format!("injected {op} failure")),
            Fault::Protocol => StorageError::Protocol(format!("injected {op} reply")),
        }
    }
}

/// Fails the listed call numbers (1-indexed) of one operation.
struct Injector {
    calls: AtomicU64,
    fail_on_calls: Vec<u64>,
    fault: Fault,
}

impl Injector {
    fn new(fail_on_calls: Vec<u64>, fault: Fault) -> Self {
        Self { calls: AtomicU64::new(0), fail_on_calls, fault }
    }

    fn none() -> Self {
        Self::new(vec![], Fault::Backend)
    }

    fn check(&self, op: &str) -> Result<(), StorageError> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_calls.contains(&count) {
            Err(self.fault.error(op))
        } else {
            Ok(())
        }
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

struct FailingDocumentStore {
    inner: Arc<InMemoryDocumentStore>,
    saves: Injector,
}

#[async_trait]
impl DocumentStore for FailingDocumentStore {
    async fn save(&self, location: &Location, entry: &DirtyEntry) -> Result<(), StorageError> {
        self.saves.check("save")?;
        self.inner.save(location, entry).await
    }

    async fn load(&self, location: &Location) -> Result<Option<StoredDocument>, StorageError> {
        self.inner.load(location).await
    }
}

struct FailingLedger {
    inner: Arc<InMemoryLedger>,
    peeks: Injector,
    advances: Injector,
}

impl FailingLedger {
    fn new(inner: Arc<InMemoryLedger>) -> Self {
        Self { inner, peeks: Injector::none(), advances: Injector::none() }
    }
}

#[async_trait]
impl DirtyLedger for FailingLedger {
    async fn peek_first(&self) -> Result<Option<DirtyEntry>, StorageError> {
        self.peeks.check("peek")?;
        self.inner.peek_first().await
    }

    async fn advance(
        &self,
        key: &str,
        expected_revision: i64,
        volatile_ttl: Duration,
    ) -> Result<Option<DirtyEntry>, StorageError> {
        self.advances.check("advance")?;
        self.inner.advance(key, expected_revision, volatile_ttl).await
    }

    async fn quarantine(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.quarantine(key).await
    }

    async fn pending(&self) -> Result<u64, StorageError> {
        self.inner.pending().await
    }
}

/// Rewrites the record readably just before delegating `quarantine`, as a
/// writer racing the drainer would.
struct RepairBeforeQuarantine {
    inner: Arc<InMemoryLedger>,
}

#[async_trait]
impl DirtyLedger for RepairBeforeQuarantine {
    async fn peek_first(&self) -> Result<Option<DirtyEntry>, StorageError> {
        self.inner.peek_first().await
    }

    async fn advance(
        &self,
        key: &str,
        expected_revision: i64,
        volatile_ttl: Duration,
    ) -> Result<Option<DirtyEntry>, StorageError> {
        self.inner.advance(key, expected_revision, volatile_ttl).await
    }

    async fn quarantine(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.insert_raw(key, encode_record(7, b"repaired"));
        self.inner.quarantine(key).await
    }

    async fn pending(&self) -> Result<u64, StorageError> {
        self.inner.pending().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn config() -> SyncConfig {
    SyncConfig {
        idle_backoff_ms: 10,
        ..Default::default()
    }
}

async fn seed(ledger: &InMemoryLedger, count: usize) {
    for i in 0..count {
        ledger.set(&format!("db:c:{i}"), b"v").await.unwrap();
    }
}

async fn drain(engine: &Arc<SyncEngine>, ledger: &InMemoryLedger) {
    let handle = engine.clone().spawn();
    tokio::time::timeout(Duration::from_secs(30), async {
        while ledger.pending().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("ledger did not drain in time");
    engine.stop();
    handle.await.unwrap().expect("drain loop failed");
}

// =============================================================================
// Store Failures
// =============================================================================

#[tokio::test]
async fn chaos_intermittent_save_failures_lose_nothing() {
    let ledger = Arc::new(InMemoryLedger::new());
    let inner = Arc::new(InMemoryDocumentStore::new());
    seed(&ledger, 20).await;

    let store = Arc::new(FailingDocumentStore {
        inner: inner.clone(),
        saves: Injector::new(vec![1, 4, 5, 9, 16, 17, 18], Fault::Backend),
    });
    let engine = Arc::new(SyncEngine::new(ledger.clone(), store.clone(), config()));
    drain(&engine, &ledger).await;

    assert_eq!(inner.len(), 20);
    assert_eq!(engine.stats().failed, 7);
    assert_eq!(store.saves.calls(), 27);
}

// =============================================================================
// Ledger Failures
// =============================================================================

#[tokio::test]
async fn chaos_advance_failure_after_save_resaves_entry() {
    let ledger = Arc::new(InMemoryLedger::new());
    let store = Arc::new(InMemoryDocumentStore::new());
    seed(&ledger, 1).await;

    let failing = FailingLedger {
        advances: Injector::new(vec![1], Fault::Backend),
        ..FailingLedger::new(ledger.clone())
    };
    let engine = Arc::new(SyncEngine::new(Arc::new(failing), store.clone(), config()));
    drain(&engine, &ledger).await;

    // Saved, ack lost, saved again: at-least-once
    let location = Location::new("db", "c", "0");
    assert_eq!(store.history(&location), vec![1, 1]);
    assert!(ledger.ttl("db:c:0").is_some());
}

#[tokio::test]
async fn chaos_peek_outage_recovers() {
    let ledger = Arc::new(InMemoryLedger::new());
    let store = Arc::new(InMemoryDocumentStore::new());
    seed(&ledger, 3).await;

    let failing = FailingLedger {
        peeks: Injector::new(vec![1, 2, 3], Fault::Backend),
        ..FailingLedger::new(ledger.clone())
    };
    let engine = Arc::new(SyncEngine::new(Arc::new(failing), store.clone(), config()));
    drain(&engine, &ledger).await;

    assert_eq!(store.len(), 3);
    assert_eq!(engine.stats().failed, 3);
}

#[tokio::test]
async fn chaos_malformed_ledger_reply_halts_engine() {
    let ledger = Arc::new(InMemoryLedger::new());
    let store = Arc::new(InMemoryDocumentStore::new());
    seed(&ledger, 3).await;

    let failing = FailingLedger {
        advances: Injector::new(vec![2], Fault::Protocol),
        ..FailingLedger::new(ledger.clone())
    };
    let engine = Arc::new(SyncEngine::new(Arc::new(failing), store.clone(), config()));

    let result = tokio::time::timeout(Duration::from_secs(5), engine.clone().spawn())
        .await
        .expect("protocol error should stop the loop")
        .unwrap();

    assert!(matches!(result, Err(StorageError::Protocol(_))));
    assert_eq!(engine.state(), EngineState::Stopped);
    // Second entry was saved but never acknowledged
    assert_eq!(store.len(), 2);
    assert_eq!(ledger.pending().await.unwrap(), 2);
}

#[tokio::test]
async fn chaos_record_repaired_before_quarantine_is_persisted() {
    let ledger = Arc::new(InMemoryLedger::new());
    let store = Arc::new(InMemoryDocumentStore::new());
    ledger.insert_raw("db:c:0", vec![0; 8]);

    let racing = RepairBeforeQuarantine { inner: ledger.clone() };
    let engine = Arc::new(SyncEngine::new(Arc::new(racing), store.clone(), config()));
    drain(&engine, &ledger).await;

    let doc = store.get(&Location::new("db", "c", "0")).unwrap();
    assert_eq!(doc, StoredDocument { revision: 7, value: b"repaired".to_vec() });
    assert!(ledger.quarantined().is_empty());
    assert_eq!(engine.stats().quarantined, 0);
}
