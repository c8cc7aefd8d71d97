//! Durable document stores the drain persists into.
//!
//! - [`sql::SqlDocumentStore`]: SQLite or MySQL via the sqlx `Any` driver
//! - [`memory::InMemoryDocumentStore`]: DashMap-backed, for tests and embedding

pub mod traits;
pub mod sql;
pub mod memory;
