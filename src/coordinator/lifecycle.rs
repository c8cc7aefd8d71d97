//! Engine lifecycle: the drain loop, pacing, and shutdown.
//!
//! One drain pass walks the ledger oldest-first until it is empty:
//!
//! ```text
//! peek_first ─► entry ─► resolve ─► save ─► advance(key, revision, ttl) ─► next entry ─┐
//!      ▲                                                                               │
//!      └─────────────── (pacing tick between acknowledgements) ◄───────────────────────┘
//! ```
//!
//! `serve()` repeats passes with an idle backoff between them. Transient
//! backend failures end the pass early and leave the entry dirty; the next
//! pass starts over from the ledger head.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CorruptPolicy;
use crate::dirty_entry::DirtyEntry;
use crate::location::Location;
use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::StorageError;

use super::{EngineState, PassOutcome, SyncEngine};

impl SyncEngine {
    /// Run the drain loop until [`stop()`](Self::stop) is called.
    ///
    /// Returns `Ok(())` after a stop, or the error that made further
    /// draining unsafe (a corrupt record under [`CorruptPolicy::Halt`] or
    /// a malformed ledger reply). Backend outages are logged and retried.
    #[tracing::instrument(skip(self), name = "drain")]
    pub async fn serve(&self) -> Result<(), StorageError> {
        let mut pacer = self.config.pacing_period().map(|period| {
            let mut pacer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            pacer
        });

        info!(
            rate = ?self.config.sync_rate,
            volatile_ttl_secs = self.config.volatile_ttl_secs,
            on_corrupt = ?self.config.on_corrupt,
            "Drain loop running"
        );

        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            match self.drain_pass(pacer.as_mut()).await {
                Ok(PassOutcome::Drained(count)) => {
                    if count > 0 {
                        debug!(count, "Ledger drained");
                    }
                    metrics::record_pass_size(count);
                    self.report_pending().await;
                }
                Ok(PassOutcome::Stopped) => break Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, backoff = ?self.config.idle_backoff(), "Drain pass failed, backing off");
                }
                Err(e) => {
                    error!(error = %e, kind = e.kind(), "Drain loop halted");
                    break Err(e);
                }
            }

            self.set_state(EngineState::Idle);
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.config.idle_backoff()) => {}
            }
        };

        self.set_state(EngineState::Stopped);
        let stats = self.stats();
        info!(
            persisted = stats.persisted,
            failed = stats.failed,
            quarantined = stats.quarantined,
            stale_acks = stats.stale_acks,
            "Drain loop stopped"
        );
        result
    }

    /// Run [`serve()`](Self::serve) on a new task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<(), StorageError>> {
        tokio::spawn(async move { self.serve().await })
    }

    /// Ask the drain loop to exit.
    ///
    /// Takes effect at the next suspension point: before the next entry is
    /// saved, during a pacing wait, or during the idle backoff. A save that
    /// is already in flight is allowed to finish. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Drain loop stop requested");
        }
        self.cancel.cancel();
    }

    /// Drain until the ledger is empty, an error occurs, or stop is requested.
    async fn drain_pass(&self, mut pacer: Option<&mut Interval>) -> Result<PassOutcome, StorageError> {
        self.set_state(EngineState::Draining);
        // The first acknowledgement of a pass goes out immediately; the next one waits a full period.
        if let Some(pacer) = pacer.as_deref_mut() {
            pacer.reset();
        }
        let mut next = self.peek().await?;
        let mut acknowledged = 0usize;

        while let Some(entry) = next {
            if self.cancel.is_cancelled() {
                return Ok(PassOutcome::Stopped);
            }

            let location = self.resolver.resolve(&entry.key);

            self.set_state(EngineState::Saving);
            self.save(&location, &entry).await?;

            self.set_state(EngineState::Acknowledging);
            next = self.advance(&entry).await?;
            acknowledged += 1;

            if let Some(pacer) = pacer.as_deref_mut() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(PassOutcome::Stopped),
                    _ = pacer.tick() => {}
                }
            }
        }

        Ok(PassOutcome::Drained(acknowledged))
    }

    async fn peek(&self) -> Result<Option<DirtyEntry>, StorageError> {
        let result = {
            let _timer = LatencyTimer::new("peek");
            self.ledger.peek_first().await
        };
        self.screen("peek", result).await
    }

    async fn save(&self, location: &Location, entry: &DirtyEntry) -> Result<(), StorageError> {
        let result = {
            let _timer = LatencyTimer::new("save");
            self.store.save(location, entry).await
        };

        match result {
            Ok(()) => {
                self.persisted.fetch_add(1, Ordering::AcqRel);
                metrics::record_persisted(&location.namespace, entry.size_bytes());
                debug!(
                    key = %entry.key,
                    revision = entry.revision,
                    location = %location,
                    "Persisted dirty entry"
                );
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::AcqRel);
                metrics::record_error("save", e.kind());
                warn!(
                    key = %entry.key,
                    revision = entry.revision,
                    location = %location,
                    error = %e,
                    "Failed to persist dirty entry; it stays dirty"
                );
                Err(e)
            }
        }
    }

    /// Acknowledge `entry` and return the next head.
    async fn advance(&self, entry: &DirtyEntry) -> Result<Option<DirtyEntry>, StorageError> {
        let result = {
            let _timer = LatencyTimer::new("advance");
            self.ledger
                .advance(&entry.key, entry.revision, self.config.volatile_ttl())
                .await
        };
        let next = self.screen("advance", result).await?;

        // A newer write keeps the key dirty at its position, so it comes back as the head.
        if let Some(head) = &next {
            if head.key == entry.key && head.revision != entry.revision {
                self.stale_acks.fetch_add(1, Ordering::AcqRel);
                metrics::record_stale_ack();
                debug!(
                    key = %entry.key,
                    saved = entry.revision,
                    current = head.revision,
                    "Newer revision landed during save; key stays dirty"
                );
            }
        }
        Ok(next)
    }

    /// Apply the corrupt-record policy to a ledger reply.
    ///
    /// Under [`CorruptPolicy::Quarantine`] corrupt heads are moved aside
    /// until a readable head (or none) is found.
    async fn screen(
        &self,
        operation: &'static str,
        mut result: Result<Option<DirtyEntry>, StorageError>,
    ) -> Result<Option<DirtyEntry>, StorageError> {
        loop {
            match result {
                Err(StorageError::Decode { key, source })
                    if self.config.on_corrupt == CorruptPolicy::Quarantine =>
                {
                    metrics::record_error(operation, "decode");
                    error!(key = %key, error = %source, "Corrupt dirty record, quarantining key");
                    match self.ledger.quarantine(&key).await {
                        Ok(true) => {
                            self.quarantined.fetch_add(1, Ordering::AcqRel);
                            metrics::record_quarantined();
                        }
                        Ok(false) => debug!(key = %key, "Record rewritten before quarantine, key stays dirty"),
                        Err(e) => {
                            self.failed.fetch_add(1, Ordering::AcqRel);
                            metrics::record_error("quarantine", e.kind());
                            return Err(e);
                        }
                    }

                    result = {
                        let _timer = LatencyTimer::new("peek");
                        self.ledger.peek_first().await
                    };
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::AcqRel);
                    metrics::record_error(operation, e.kind());
                    return Err(e);
                }
                Ok(next) => return Ok(next),
            }
        }
    }

    async fn report_pending(&self) {
        match self.ledger.pending().await {
            Ok(count) => metrics::set_pending(count),
            Err(e) => debug!(error = %e, "Could not read pending count"),
        }
    }
}
