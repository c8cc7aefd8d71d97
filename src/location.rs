// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mapping cache keys to durable-store addresses.
//!
//! Every dirty key is persisted at a [`Location`] `(namespace, group, id)`.
//! The mapping is pure: no I/O, no state, same key → same location.
//!
//! # Default policy
//!
//! [`DefaultResolver`] splits the key on a delimiter (`:` unless configured)
//! into at most three parts:
//!
//! ```
//! use dirty_drain::{DefaultResolver, Location, LocationResolver};
//!
//! let resolver = DefaultResolver::default();
//! assert_eq!(resolver.resolve("db:coll:42"), Location::new("db", "coll", "42"));
//! assert_eq!(resolver.resolve("coll:42"), Location::new("default", "coll", "42"));
//! assert_eq!(resolver.resolve("42"), Location::new("default", "default", "42"));
//! ```
//!
//! # Custom policy
//!
//! Any `Fn(&str) -> Location` works as a resolver:
//!
//! ```
//! use dirty_drain::{Location, LocationResolver};
//!
//! let by_prefix = |key: &str| Location::new("app", "users", key.trim_start_matches("user."));
//! assert_eq!(by_prefix.resolve("user.alice"), Location::new("app", "users", "alice"));
//! ```

use std::fmt;

/// Namespace used for missing leading parts of a key.
pub const DEFAULT_SEGMENT: &str = "default";

/// Durable-store address of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub namespace: String,
    pub group: String,
    pub id: String,
}

impl Location {
    pub fn new(namespace: impl Into<String>, group: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.group, self.id)
    }
}

/// Maps a cache key to its durable [`Location`].
pub trait LocationResolver: Send + Sync {
    fn resolve(&self, key: &str) -> Location;
}

impl<F> LocationResolver for F
where
    F: Fn(&str) -> Location + Send + Sync,
{
    fn resolve(&self, key: &str) -> Location {
        self(key)
    }
}

/// Delimiter-splitting resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultResolver {
    delimiter: char,
}

impl DefaultResolver {
    #[must_use]
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    #[must_use]
    pub fn delimiter(&self) -> char {
        self.delimiter
    }
}

impl Default for DefaultResolver {
    fn default() -> Self {
        Self::new(':')
    }
}

impl LocationResolver for DefaultResolver {
    fn resolve(&self, key: &str) -> Location {
        let parts: Vec<&str> = key.splitn(3, self.delimiter).collect();
        match parts.as_slice() {
            [namespace, group, id] => Location::new(*namespace, *group, *id),
            [group, id] => Location::new(DEFAULT_SEGMENT, *group, *id),
            _ => Location::new(DEFAULT_SEGMENT, DEFAULT_SEGMENT, key),
        }
    }
}
