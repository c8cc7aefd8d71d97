use std::time::Duration;

use async_trait::async_trait;

use crate::dirty_entry::DirtyEntry;
use crate::storage::traits::StorageError;

/// The ordered set of dirty keys, hosted inside the cache store.
///
/// Both operations are a single atomic round trip: no other writer can
/// interleave between examining and mutating ledger state.
#[async_trait]
pub trait DirtyLedger: Send + Sync {
    /// Oldest still-dirty key and its current entry. Never mutates.
    async fn peek_first(&self) -> Result<Option<DirtyEntry>, StorageError>;

    /// Acknowledge `key` at `expected_revision` and return the next entry.
    ///
    /// If the stored revision still equals `expected_revision` the key leaves
    /// the dirty set and gets `volatile_ttl`; otherwise a newer write landed
    /// and the key stays dirty. Either way the new head is returned.
    async fn advance(
        &self,
        key: &str,
        expected_revision: i64,
        volatile_ttl: Duration,
    ) -> Result<Option<DirtyEntry>, StorageError>;

    /// Move a key whose record cannot be decoded out of the dirty set.
    ///
    /// Checked atomically against the current record: returns `false` and
    /// leaves the key dirty if it was rewritten readably in the meantime.
    /// A key whose record is gone is dropped from the dirty set.
    async fn quarantine(&self, key: &str) -> Result<bool, StorageError>;

    /// Number of dirty keys.
    async fn pending(&self) -> Result<u64, StorageError>;
}

/// Options for [`WriteThrough::get`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Seed this value through the write path when the key is missing.
    pub create_on_miss: Option<Vec<u8>>,
}

impl ReadOptions {
    #[must_use]
    pub fn create_on_miss(default: impl Into<Vec<u8>>) -> Self {
        Self {
            create_on_miss: Some(default.into()),
        }
    }
}

/// Application-facing write path that feeds the ledger.
#[async_trait]
pub trait WriteThrough: Send + Sync {
    /// Store `value`, bump the key's revision and mark it dirty.
    /// Returns the new revision.
    async fn set(&self, key: &str, value: &[u8]) -> Result<i64, StorageError>;

    async fn get(&self, key: &str, options: &ReadOptions) -> Result<Option<Vec<u8>>, StorageError>;
}
