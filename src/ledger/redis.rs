// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-hosted dirty ledger.
//!
//! # Key layout
//!
//! ```text
//! {prefix}{key}              STRING   record: revision (8 B, BE) || value
//! {prefix}__dirty__          ZSET     dirty keys scored by write sequence
//! {prefix}__dirty_seq__      STRING   INCR counter feeding the scores
//! {prefix}__quarantine__     SET      keys whose record failed to decode
//! ```
//!
//! Dirty records carry no TTL (a plain `SET` clears it), so a
//! `volatile-lru`/`volatile-lfu` maxmemory policy can only evict keys that
//! were acknowledged by `advance` and given the volatile TTL.
//!
//! # Scripts
//!
//! `PEEK`, `ADVANCE`, `QUARANTINE` and the write path's `MARK` each run as
//! one Lua script, so nothing interleaves between reading a record and
//! mutating the ledger around it.
//! `ADVANCE` compares the stored 8-byte revision prefix with the expected
//! one byte for byte; Lua never has to decode the 64-bit integer.
//! `MARK` refuses to build on an unreadable record and replies
//! `{"corrupt", record}` instead, and `QUARANTINE` only moves a key aside
//! while its record is still unreadable.
//!
//! Record keys are derived from `ARGV` inside the scripts, so on Redis
//! Cluster the prefix must carry a hash tag (e.g. `{app}:`) to keep every
//! ledger key in one slot.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script, Value};
use tracing::debug;

use crate::dirty_entry::{decode_record, encode_revision, DirtyEntry};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;
use super::traits::{DirtyLedger, ReadOptions, WriteThrough};

/// Shared by PEEK and ADVANCE: first dirty key whose record still exists.
const HEAD_LUA: &str = r#"
local function head(dirty, prefix)
  while true do
    local first = redis.call('ZRANGE', dirty, 0, 0)
    if #first == 0 then
      return false
    end
    local record = redis.call('GET', prefix .. first[1])
    if record then
      return {first[1], record}
    end
    -- evicted before it was ever persisted: nothing left to save
    redis.call('ZREM', dirty, first[1])
  end
end
"#;

/// Shared by MARK and QUARANTINE: an 8-byte prefix holding a revision >= 1.
const READABLE_LUA: &str = r#"
local function readable(record)
  if string.len(record) < 8 then
    return false
  end
  return string.byte(record, 1) < 128 and string.sub(record, 1, 8) ~= string.rep('\0', 8)
end
"#;

const PEEK_LUA: &str = r#"
return head(KEYS[1], ARGV[1])
"#;

const ADVANCE_LUA: &str = r#"
local entry_key = ARGV[1] .. ARGV[2]
local record = redis.call('GET', entry_key)
if record and string.sub(record, 1, 8) == ARGV[3] then
  redis.call('ZREM', KEYS[1], ARGV[2])
  redis.call('PEXPIRE', entry_key, ARGV[4])
end
return head(KEYS[1], ARGV[1])
"#;

const MARK_LUA: &str = r#"
local entry_key = ARGV[1] .. ARGV[2]
local record = redis.call('GET', entry_key)
if record and ARGV[4] == '1' then
  return record
end
local revision = 1
if record then
  if not readable(record) then
    return {'corrupt', record}
  end
  revision = struct.unpack('>i8', record) + 1
end
local updated = struct.pack('>i8', revision) .. ARGV[3]
redis.call('SET', entry_key, updated)
redis.call('SREM', KEYS[3], ARGV[2])
if not redis.call('ZSCORE', KEYS[1], ARGV[2]) then
  redis.call('ZADD', KEYS[1], redis.call('INCR', KEYS[2]), ARGV[2])
end
return updated
"#;

const QUARANTINE_LUA: &str = r#"
local record = redis.call('GET', ARGV[1] .. ARGV[2])
if record and readable(record) then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
if not record then
  return 0
end
redis.call('SADD', KEYS[2], ARGV[2])
return 1
"#;

/// Names of the ledger's bookkeeping keys for one prefix.
#[derive(Debug, Clone)]
struct LedgerKeys {
    prefix: String,
    dirty: String,
    sequence: String,
    quarantine: String,
}

impl LedgerKeys {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            dirty: format!("{}__dirty__", prefix),
            sequence: format!("{}__dirty_seq__", prefix),
            quarantine: format!("{}__quarantine__", prefix),
        }
    }

    fn record(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

pub struct RedisLedger {
    connection: ConnectionManager,
    keys: LedgerKeys,
    peek_script: Script,
    advance_script: Script,
    mark_script: Script,
    quarantine_script: Script,
}

impl RedisLedger {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix (e.g. `"myapp:"`).
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)?;

        // Startup config: fast-fail after a few seconds, don't hang forever
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;

        Ok(Self::from_connection(connection, prefix))
    }

    /// Build on an existing connection (shared with the application's client).
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self {
            connection,
            keys: LedgerKeys::new(prefix.unwrap_or("")),
            peek_script: Script::new(&format!("{}{}", HEAD_LUA, PEEK_LUA)),
            advance_script: Script::new(&format!("{}{}", HEAD_LUA, ADVANCE_LUA)),
            mark_script: Script::new(&format!("{}{}", READABLE_LUA, MARK_LUA)),
            quarantine_script: Script::new(&format!("{}{}", READABLE_LUA, QUARANTINE_LUA)),
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.keys.prefix
    }

    /// Keys currently in quarantine.
    pub async fn quarantined(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&self.keys.quarantine)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    /// Remaining TTL of a record; `None` if missing or not volatile.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let mut conn = self.connection.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(self.keys.record(key))
            .query_async(&mut conn)
            .await?;
        // -2: missing, -1: no expiry
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    /// Run the write-path script, returning the resulting record.
    async fn mark(&self, key: &str, value: &[u8], only_if_absent: bool) -> Result<Vec<u8>, StorageError> {
        let conn = self.connection.clone();
        let flag = if only_if_absent { "1" } else { "0" };

        let reply: Value = retry("ledger_mark", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let mut invocation = self.mark_script.prepare_invoke();
            invocation
                .key(&self.keys.dirty)
                .key(&self.keys.sequence)
                .key(&self.keys.quarantine)
                .arg(&self.keys.prefix)
                .arg(key)
                .arg(value)
                .arg(flag);
            async move {
                let reply: Value = invocation.invoke_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(reply)
            }
        })
        .await?;

        parse_mark(key, reply)
    }
}

/// Translate a MARK reply: the resulting record, or `{"corrupt", record}`
/// when the stored record could not be built on.
fn parse_mark(key: &str, reply: Value) -> Result<Vec<u8>, StorageError> {
    match reply {
        Value::BulkString(record) => Ok(record),
        Value::Array(items) => match items.as_slice() {
            [Value::BulkString(tag), Value::BulkString(record)] if tag.as_slice() == b"corrupt" => {
                match decode_record(record) {
                    Err(source) => Err(StorageError::Decode { key: key.to_string(), source }),
                    Ok(_) => Err(StorageError::Protocol(format!(
                        "MARK rejected a readable record for '{}'", key
                    ))),
                }
            }
            _ => Err(StorageError::Protocol(format!(
                "MARK returned {:?}, expected a record", items
            ))),
        },
        other => Err(StorageError::Protocol(format!(
            "MARK returned {:?}, expected a record", other
        ))),
    }
}

/// Translate a `[key, record]`-or-nil script reply into the head entry.
fn parse_head(reply: Value) -> Result<Option<DirtyEntry>, StorageError> {
    let items = match reply {
        Value::Nil => return Ok(None),
        Value::Array(items) if items.len() == 2 => items,
        other => {
            return Err(StorageError::Protocol(format!(
                "expected [key, record] or nil, got {:?}", other
            )));
        }
    };

    let mut items = items.into_iter();
    let (Some(Value::BulkString(key)), Some(Value::BulkString(record))) = (items.next(), items.next()) else {
        return Err(StorageError::Protocol("head reply items must be bulk strings".into()));
    };
    let key = String::from_utf8(key)
        .map_err(|e| StorageError::Protocol(format!("dirty key is not UTF-8: {}", e)))?;

    DirtyEntry::decode(key.clone(), &record)
        .map(Some)
        .map_err(|source| StorageError::Decode { key, source })
}

#[async_trait]
impl DirtyLedger for RedisLedger {
    async fn peek_first(&self) -> Result<Option<DirtyEntry>, StorageError> {
        let conn = self.connection.clone();

        let reply: Value = retry("ledger_peek", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let mut invocation = self.peek_script.prepare_invoke();
            invocation.key(&self.keys.dirty).arg(&self.keys.prefix);
            async move {
                let reply: Value = invocation.invoke_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(reply)
            }
        })
        .await?;

        parse_head(reply)
    }

    async fn advance(
        &self,
        key: &str,
        expected_revision: i64,
        volatile_ttl: Duration,
    ) -> Result<Option<DirtyEntry>, StorageError> {
        let conn = self.connection.clone();
        let expected = encode_revision(expected_revision);
        // PEXPIRE 0 would delete the record outright
        let ttl_ms = volatile_ttl.as_millis().max(1) as u64;

        let reply: Value = retry("ledger_advance", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let mut invocation = self.advance_script.prepare_invoke();
            invocation
                .key(&self.keys.dirty)
                .arg(&self.keys.prefix)
                .arg(key)
                .arg(&expected[..])
                .arg(ttl_ms);
            async move {
                let reply: Value = invocation.invoke_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(reply)
            }
        })
        .await?;

        parse_head(reply)
    }

    async fn quarantine(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();

        let moved: i64 = retry("ledger_quarantine", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let mut invocation = self.quarantine_script.prepare_invoke();
            invocation
                .key(&self.keys.dirty)
                .key(&self.keys.quarantine)
                .arg(&self.keys.prefix)
                .arg(key);
            async move {
                let moved: i64 = invocation.invoke_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(moved)
            }
        })
        .await?;

        if moved == 1 {
            debug!(key = %key, "Moved key to quarantine");
        } else {
            debug!(key = %key, "Record rewritten or gone, not quarantined");
        }
        Ok(moved == 1)
    }

    async fn pending(&self) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let count: u64 = redis::cmd("ZCARD")
            .arg(&self.keys.dirty)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl WriteThrough for RedisLedger {
    async fn set(&self, key: &str, value: &[u8]) -> Result<i64, StorageError> {
        let record = self.mark(key, value, false).await?;
        decode_record(&record)
            .map(|(revision, _)| revision)
            .map_err(|source| StorageError::Decode { key: key.to_string(), source })
    }

    async fn get(&self, key: &str, options: &ReadOptions) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.connection.clone();
        let record_key = self.keys.record(key);

        let record: Option<Vec<u8>> = retry("ledger_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let record_key = record_key.clone();
            async move {
                let record: Option<Vec<u8>> = redis::cmd("GET")
                    .arg(&record_key)
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, redis::RedisError>(record)
            }
        })
        .await?;

        let record = match (record, &options.create_on_miss) {
            (Some(record), _) => record,
            (None, Some(default)) => self.mark(key, default, true).await?,
            (None, None) => return Ok(None),
        };

        decode_record(&record)
            .map(|(_, value)| Some(value.to_vec()))
            .map_err(|source| StorageError::Decode { key: key.to_string(), source })
    }
}
