// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Drain engine coordinator.
//!
//! The [`SyncEngine`] ties a [`DirtyLedger`] to a [`DocumentStore`]: it
//! repeatedly takes the oldest dirty entry, persists it at the location the
//! resolver picks for its key, and acknowledges the revision it saved.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Idle ⇄ Draining → Saving → Acknowledging → … → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dirty_drain::{
//!     EngineState, InMemoryDocumentStore, InMemoryLedger, SyncConfig, SyncEngine,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let ledger = Arc::new(InMemoryLedger::new());
//! let store = Arc::new(InMemoryDocumentStore::new());
//! let engine = Arc::new(SyncEngine::new(ledger, store, SyncConfig::default()));
//!
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! let handle = engine.clone().spawn();
//! engine.stop();
//! handle.await.unwrap().unwrap();
//! # }
//! ```

mod types;
mod lifecycle;

pub use types::{DrainStats, EngineState};
use types::PassOutcome;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SyncConfig;
use crate::ledger::redis::RedisLedger;
use crate::ledger::traits::DirtyLedger;
use crate::location::{DefaultResolver, LocationResolver};
use crate::storage::sql::SqlDocumentStore;
use crate::storage::traits::{DocumentStore, StorageError};

/// Write-behind drain engine.
///
/// Any number of engines may drain the same ledger; the revision check in
/// [`DirtyLedger::advance`] keeps them from acknowledging each other's
/// unsaved writes. A save may be repeated, so stores must upsert.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`. `serve()` takes `&self`, so an
/// `Arc<SyncEngine>` can be served on one task and stopped from another.
pub struct SyncEngine {
    pub(super) config: SyncConfig,

    pub(super) ledger: Arc<dyn DirtyLedger>,

    pub(super) store: Arc<dyn DocumentStore>,

    /// Maps ledger keys to durable locations
    pub(super) resolver: Arc<dyn LocationResolver>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Fired by [`stop()`](Self::stop); observed at every suspension point
    pub(super) cancel: CancellationToken,

    pub(super) persisted: AtomicU64,
    pub(super) failed: AtomicU64,
    pub(super) quarantined: AtomicU64,
    pub(super) stale_acks: AtomicU64,
}

impl SyncEngine {
    /// Create an engine over explicit backends.
    ///
    /// Keys are resolved with a [`DefaultResolver`] on
    /// `config.key_delimiter`; use [`with_resolver`](Self::with_resolver)
    /// to replace it.
    pub fn new(
        ledger: Arc<dyn DirtyLedger>,
        store: Arc<dyn DocumentStore>,
        config: SyncConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let resolver = Arc::new(DefaultResolver::new(config.key_delimiter));

        Self {
            config,
            ledger,
            store,
            resolver,
            state: state_tx,
            state_rx,
            cancel: CancellationToken::new(),
            persisted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            stale_acks: AtomicU64::new(0),
        }
    }

    /// Connect to the Redis ledger and SQL store named in `config`.
    ///
    /// Both URLs are required. Connections are retried with the startup
    /// policy before giving up.
    pub async fn connect(config: SyncConfig) -> Result<Self, StorageError> {
        let redis_url = config.redis_url.clone()
            .ok_or_else(|| StorageError::Config("redis_url is required".into()))?;
        let sql_url = config.sql_url.clone()
            .ok_or_else(|| StorageError::Config("sql_url is required".into()))?;

        info!(prefix = ?config.redis_prefix, "Connecting to Redis ledger...");
        let ledger = RedisLedger::with_prefix(&redis_url, config.redis_prefix.as_deref()).await?;

        info!("Connecting to SQL document store...");
        let store = SqlDocumentStore::new(&sql_url).await?;

        info!("Drain backends connected");
        Ok(Self::new(Arc::new(ledger), Arc::new(store), config))
    }

    /// Replace the key → location mapping.
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl LocationResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Whether [`stop()`](Self::stop) has been requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn stats(&self) -> DrainStats {
        DrainStats {
            persisted: self.persisted.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            quarantined: self.quarantined.load(Ordering::Acquire),
            stale_acks: self.stale_acks.load(Ordering::Acquire),
        }
    }

    /// Publish a state change; repeated states are not re-broadcast.
    pub(super) fn set_state(&self, next: EngineState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            crate::metrics::set_engine_state(next.as_str());
        }
    }
}
