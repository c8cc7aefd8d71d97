use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::dirty_entry::DirtyEntry;
use crate::location::Location;
use super::traits::{DocumentStore, StorageError, StoredDocument};

/// In-memory durable store.
///
/// Also records the revision history per location and can be told to fail
/// the next N saves, which the drain tests use to simulate outages.
pub struct InMemoryDocumentStore {
    data: DashMap<Location, StoredDocument>,
    history: DashMap<Location, Vec<i64>>,
    saves: AtomicU64,
    fail_remaining: AtomicU64,
}

impl InMemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            history: DashMap::new(),
            saves: AtomicU64::new(0),
            fail_remaining: AtomicU64::new(0),
        }
    }

    /// Get current document count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of successful saves (including idempotent re-saves).
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Acquire)
    }

    /// Make the next `n` saves fail with a backend error.
    pub fn fail_next(&self, n: u64) {
        self.fail_remaining.store(n, Ordering::Release);
    }

    /// Revisions applied at `location`, in save order. Saves ignored for
    /// carrying an older revision are not listed.
    #[must_use]
    pub fn history(&self, location: &Location) -> Vec<i64> {
        self.history
            .get(location)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get(&self, location: &Location) -> Option<StoredDocument> {
        self.data.get(location).map(|d| d.value().clone())
    }

    fn take_failure(&self) -> bool {
        self.fail_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn save(&self, location: &Location, entry: &DirtyEntry) -> Result<(), StorageError> {
        if self.take_failure() {
            return Err(StorageError::Backend(format!(
                "injected failure saving {}", location
            )));
        }
        let applied = match self.data.entry(location.clone()) {
            Entry::Occupied(mut stored) => {
                if stored.get().revision > entry.revision {
                    false
                } else {
                    stored.insert(StoredDocument::from(entry));
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredDocument::from(entry));
                true
            }
        };
        if applied {
            self.history
                .entry(location.clone())
                .or_default()
                .push(entry.revision);
        }
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn load(&self, location: &Location) -> Result<Option<StoredDocument>, StorageError> {
        Ok(self.get(location))
    }
}
