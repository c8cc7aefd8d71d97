// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL document store: the durable side of the drain.
//!
//! Every location `(namespace, group, id)` is one row, so namespaces and
//! groups exist as soon as a document is saved into them:
//!
//! ```sql
//! CREATE TABLE sync_documents (
//!   ns       VARCHAR(191) NOT NULL,
//!   grp      VARCHAR(191) NOT NULL,
//!   id       VARCHAR(191) NOT NULL,
//!   revision BIGINT NOT NULL,
//!   value    LONGBLOB NOT NULL,
//!   PRIMARY KEY (ns, grp, id)
//! )
//! ```
//!
//! Saves are a single `INSERT .. ON CONFLICT DO UPDATE` (SQLite) or
//! `INSERT .. ON DUPLICATE KEY UPDATE` (MySQL), which makes them atomic and
//! idempotent.

use async_trait::async_trait;
use sqlx::{AnyPool, Row, any::AnyPoolOptions};
use std::sync::Once;
use std::time::Duration;

use crate::dirty_entry::DirtyEntry;
use crate::location::Location;
use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{DocumentStore, StorageError, StoredDocument};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlDocumentStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlDocumentStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(StorageError::from)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// WAL journal mode: readers don't block the drain's writes.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS sync_documents (
                ns TEXT NOT NULL,
                grp TEXT NOT NULL,
                id TEXT NOT NULL,
                revision INTEGER NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (ns, grp, id)
            )
            "#
        } else {
            // 191 chars keeps the utf8mb4 composite key under InnoDB's 3072-byte limit
            r#"
            CREATE TABLE IF NOT EXISTS sync_documents (
                ns VARCHAR(191) NOT NULL,
                grp VARCHAR(191) NOT NULL,
                id VARCHAR(191) NOT NULL,
                revision BIGINT NOT NULL,
                value LONGBLOB NOT NULL,
                PRIMARY KEY (ns, grp, id)
            )
            "#
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(StorageError::from)
        })
        .await?;

        Ok(())
    }

    fn upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO sync_documents (ns, grp, id, revision, value) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(ns, grp, id) DO UPDATE SET
                revision = excluded.revision,
                value = excluded.value
             WHERE excluded.revision >= sync_documents.revision"
        } else {
            "INSERT INTO sync_documents (ns, grp, id, revision, value) VALUES (?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                value = IF(VALUES(revision) >= revision, VALUES(value), value),
                revision = GREATEST(revision, VALUES(revision))"
        }
    }

    /// Count stored documents, optionally within one namespace.
    pub async fn count(&self, namespace: Option<&str>) -> Result<u64, StorageError> {
        let count: i64 = match namespace {
            Some(ns) => sqlx::query("SELECT COUNT(*) AS cnt FROM sync_documents WHERE ns = ?")
                .bind(ns.to_string())
                .fetch_one(&self.pool)
                .await?
                .try_get("cnt")?,
            None => sqlx::query("SELECT COUNT(*) AS cnt FROM sync_documents")
                .fetch_one(&self.pool)
                .await?
                .try_get("cnt")?,
        };
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl DocumentStore for SqlDocumentStore {
    async fn save(&self, location: &Location, entry: &DirtyEntry) -> Result<(), StorageError> {
        let sql = self.upsert_sql();

        retry("sql_save", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(&location.namespace)
                .bind(&location.group)
                .bind(&location.id)
                .bind(entry.revision)
                .bind(entry.value.clone())
                .execute(&self.pool)
                .await
                .map_err(StorageError::from)?;
            Ok(())
        })
        .await
    }

    async fn load(&self, location: &Location) -> Result<Option<StoredDocument>, StorageError> {
        retry("sql_load", &RetryConfig::query(), || async {
            let row = sqlx::query(
                "SELECT revision, value FROM sync_documents WHERE ns = ? AND grp = ? AND id = ?"
            )
                .bind(&location.namespace)
                .bind(&location.group)
                .bind(&location.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::from)?;

            match row {
                Some(row) => {
                    let revision: i64 = row.try_get("revision")?;
                    let value: Vec<u8> = row.try_get("value")?;
                    Ok(Some(StoredDocument { revision, value }))
                }
                None => Ok(None),
            }
        })
        .await
    }
}
