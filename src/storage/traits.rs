use async_trait::async_trait;
use thiserror::Error;

use crate::dirty_entry::{DecodeError, DirtyEntry};
use crate::location::Location;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt record for '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: DecodeError,
    },
    #[error("Unexpected reply from ledger script: {0}")]
    Protocol(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Transient errors leave the entry dirty and are retried after backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::Decode { .. } => "decode",
            Self::Protocol(_) => "protocol",
            Self::Config(_) => "config",
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// A document as persisted in the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub revision: i64,
    pub value: Vec<u8>,
}

impl From<&DirtyEntry> for StoredDocument {
    fn from(entry: &DirtyEntry) -> Self {
        Self {
            revision: entry.revision,
            value: entry.value.clone(),
        }
    }
}

/// Durable side of the drain: upserts `{revision, value}` at a location.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Single atomic upsert keyed by `location`. Re-saving the same
    /// `(location, revision, value)` must have no further effect, and a save
    /// carrying a lower revision than the stored one must leave it untouched.
    async fn save(&self, location: &Location, entry: &DirtyEntry) -> Result<(), StorageError>;

    async fn load(&self, location: &Location) -> Result<Option<StoredDocument>, StorageError>;
}
