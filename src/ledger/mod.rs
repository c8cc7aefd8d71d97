//! Dirty ledger: which cached keys still owe a durable write.
//!
//! # Protocol
//!
//! ```text
//!  peek_first() ──► (key, entry)            no mutation
//!  advance(key, rev, ttl)
//!      stored rev == rev ──► clear dirty, apply TTL ─┐
//!      stored rev != rev ──► leave dirty ────────────┤
//!                                                    ▼
//!                                        return new head (or None)
//! ```
//!
//! - [`redis::RedisLedger`]: Lua scripts, one round trip per operation
//! - [`memory::InMemoryLedger`]: same protocol behind a mutex

pub mod traits;
pub mod memory;
pub mod redis;
