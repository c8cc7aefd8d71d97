// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process dirty ledger.
//!
//! Mirrors the Redis layout: encoded records keyed by cache key, plus an
//! ordered index of dirty keys. Every operation runs under one
//! `parking_lot::Mutex`, which plays the role of the Lua script's atomicity.
//! The lock is never held across an `.await`.
//!
//! Expiry uses [`tokio::time::Instant`], so paused-clock tests can observe
//! the volatile TTL.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::dirty_entry::{decode_record, encode_record, encode_revision, DirtyEntry, REVISION_LEN};
use crate::storage::traits::StorageError;
use super::traits::{DirtyLedger, ReadOptions, WriteThrough};

#[derive(Debug)]
struct Record {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    records: HashMap<String, Record>,
    /// Dirty index: insertion sequence → key (oldest first)
    dirty: BTreeMap<u64, String>,
    positions: HashMap<String, u64>,
    quarantined: BTreeSet<String>,
    next_seq: u64,
}

impl LedgerState {
    fn live_record(&mut self, key: &str, now: Instant) -> Option<&mut Record> {
        if self.records.get(key).is_some_and(|r| !r.is_live(now)) {
            self.records.remove(key);
        }
        self.records.get_mut(key)
    }

    fn mark_dirty(&mut self, key: &str) {
        if !self.positions.contains_key(key) {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.dirty.insert(seq, key.to_string());
            self.positions.insert(key.to_string(), seq);
        }
    }

    fn clear_dirty(&mut self, key: &str) {
        if let Some(seq) = self.positions.remove(key) {
            self.dirty.remove(&seq);
        }
    }

    /// First dirty entry. Keys whose record vanished are dropped from the index.
    fn head(&mut self, now: Instant) -> Result<Option<DirtyEntry>, StorageError> {
        loop {
            let Some(key) = self.dirty.values().next().cloned() else {
                return Ok(None);
            };
            match self.live_record(&key, now) {
                Some(record) => {
                    return DirtyEntry::decode(key.clone(), &record.bytes)
                        .map(Some)
                        .map_err(|source| StorageError::Decode { key, source });
                }
                None => self.clear_dirty(&key),
            }
        }
    }

    /// Write path: bump revision, store the record, mark dirty.
    fn write(&mut self, key: &str, value: &[u8], now: Instant) -> Result<i64, StorageError> {
        let current = match self.live_record(key, now) {
            Some(record) => decode_record(&record.bytes)
                .map(|(rev, _)| rev)
                .map_err(|source| StorageError::Decode { key: key.to_string(), source })?,
            None => 0,
        };
        let revision = current + 1;
        self.records.insert(key.to_string(), Record {
            bytes: encode_record(revision, value),
            expires_at: None,
        });
        self.quarantined.remove(key);
        self.mark_dirty(key);
        Ok(revision)
    }
}

/// Dirty ledger held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw record bytes and mark the key dirty, bypassing the codec.
    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        state.records.insert(key.to_string(), Record { bytes, expires_at: None });
        state.mark_dirty(key);
    }

    #[must_use]
    pub fn is_dirty(&self, key: &str) -> bool {
        self.state.lock().positions.contains_key(key)
    }

    /// Whether the key still has a live (unexpired) record.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().live_record(key, Instant::now()).is_some()
    }

    /// Remaining time to live, `None` if the key is missing or not volatile.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .live_record(key, now)
            .and_then(|r| r.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    #[must_use]
    pub fn quarantined(&self) -> Vec<String> {
        self.state.lock().quarantined.iter().cloned().collect()
    }

    /// Dirty keys, oldest first.
    #[must_use]
    pub fn dirty_keys(&self) -> Vec<String> {
        self.state.lock().dirty.values().cloned().collect()
    }
}

#[async_trait]
impl DirtyLedger for InMemoryLedger {
    async fn peek_first(&self) -> Result<Option<DirtyEntry>, StorageError> {
        self.state.lock().head(Instant::now())
    }

    async fn advance(
        &self,
        key: &str,
        expected_revision: i64,
        volatile_ttl: Duration,
    ) -> Result<Option<DirtyEntry>, StorageError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expected = encode_revision(expected_revision);

        let acknowledged = match state.live_record(key, now) {
            Some(record) if record.bytes.get(..REVISION_LEN) == Some(&expected[..]) => {
                record.expires_at = Some(now + volatile_ttl);
                true
            }
            _ => false,
        };
        if acknowledged {
            state.clear_dirty(key);
        }

        state.head(now)
    }

    async fn quarantine(&self, key: &str) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        let readable = state
            .live_record(key, Instant::now())
            .map(|record| decode_record(&record.bytes).is_ok());
        match readable {
            Some(true) => return Ok(false),
            None => {
                state.clear_dirty(key);
                return Ok(false);
            }
            Some(false) => {}
        }
        state.clear_dirty(key);
        state.quarantined.insert(key.to_string());
        Ok(true)
    }

    async fn pending(&self) -> Result<u64, StorageError> {
        Ok(self.state.lock().dirty.len() as u64)
    }
}

#[async_trait]
impl WriteThrough for InMemoryLedger {
    async fn set(&self, key: &str, value: &[u8]) -> Result<i64, StorageError> {
        self.state.lock().write(key, value, Instant::now())
    }

    async fn get(&self, key: &str, options: &ReadOptions) -> Result<Option<Vec<u8>>, StorageError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(record) = state.live_record(key, now) {
            let (_, value) = decode_record(&record.bytes)
                .map_err(|source| StorageError::Decode { key: key.to_string(), source })?;
            return Ok(Some(value.to_vec()));
        }

        match &options.create_on_miss {
            Some(default) => {
                state.write(key, default, now)?;
                Ok(Some(default.clone()))
            }
            None => Ok(None),
        }
    }
}
