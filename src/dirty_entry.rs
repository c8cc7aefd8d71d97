// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dirty entry and its compact record codec.
//!
//! A [`DirtyEntry`] is a cached key whose latest write has not been persisted
//! yet. Inside the cache store the entry is kept as a fixed binary record:
//!
//! ```text
//! ┌──────────────────────────┬─────────────────────────┐
//! │ revision (i64, BE, 8 B)  │ value (raw bytes, 0..N) │
//! └──────────────────────────┴─────────────────────────┘
//! ```
//!
//! The big-endian prefix lets the ledger scripts compare revisions with a
//! plain byte comparison instead of decoding numbers inside Lua.
//!
//! # Example
//!
//! ```
//! use dirty_drain::DirtyEntry;
//!
//! let entry = DirtyEntry::new("db:coll:42", 3, b"hello".to_vec());
//! let record = entry.encode();
//! assert_eq!(record.len(), 8 + 5);
//!
//! let decoded = DirtyEntry::decode("db:coll:42", &record).unwrap();
//! assert_eq!(decoded, entry);
//! ```

use thiserror::Error;

/// Size of the revision prefix in an encoded record.
pub const REVISION_LEN: usize = 8;

/// Reasons a stored record cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record truncated: {len} bytes, need at least {REVISION_LEN}")]
    Truncated { len: usize },
    #[error("invalid revision {0}: revisions start at 1")]
    InvalidRevision(i64),
}

/// A key with an unpersisted write: its revision and raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyEntry {
    pub key: String,
    /// Per-key write counter, strictly increasing, assigned by the write path.
    pub revision: i64,
    pub value: Vec<u8>,
}

impl DirtyEntry {
    pub fn new(key: impl Into<String>, revision: i64, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            revision,
            value,
        }
    }

    /// Encode as `revision || value`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encode_record(self.revision, &self.value)
    }

    /// Decode a stored record belonging to `key`.
    pub fn decode(key: impl Into<String>, record: &[u8]) -> Result<Self, DecodeError> {
        let (revision, value) = decode_record(record)?;
        Ok(Self {
            key: key.into(),
            revision,
            value: value.to_vec(),
        })
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.key.len() + REVISION_LEN + self.value.len()
    }
}

/// Encode a revision as the 8-byte record prefix.
#[inline]
#[must_use]
pub fn encode_revision(revision: i64) -> [u8; REVISION_LEN] {
    revision.to_be_bytes()
}

#[must_use]
pub fn encode_record(revision: i64, value: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(REVISION_LEN + value.len());
    record.extend_from_slice(&encode_revision(revision));
    record.extend_from_slice(value);
    record
}

/// Split a record into its revision and a borrowed view of the value.
pub fn decode_record(record: &[u8]) -> Result<(i64, &[u8]), DecodeError> {
    if record.len() < REVISION_LEN {
        return Err(DecodeError::Truncated { len: record.len() });
    }
    let (prefix, value) = record.split_at(REVISION_LEN);
    let mut bytes = [0u8; REVISION_LEN];
    bytes.copy_from_slice(prefix);
    let revision = i64::from_be_bytes(bytes);
    if revision < 1 {
        return Err(DecodeError::InvalidRevision(revision));
    }
    Ok((revision, value))
}
