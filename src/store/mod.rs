//! Backing Store Client
//!
//! Thin abstraction over the key-value protocol the engine needs: batched
//! reads, writes with TTL, and server-side scripts addressed by hash.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        ShardedStore                            │
//! │   HashRing (consistent hashing) ── ScriptCache (loaded SHAs)   │
//! ├──────────────────────┬──────────────────────┬─────────────────┤
//! │ Shard 0              │ Shard 1              │ Shard N          │
//! │  primary ◀─ scripts  │  primary             │  primary         │
//! │  replicas ◀─ reads   │  replicas            │  replicas        │
//! └──────────────────────┴──────────────────────┴─────────────────┘
//! ```
//!
//! Each node is a [`KvNode`]: [`RedisNode`] in production, [`InMemoryNode`]
//! for tests and single-process embedding.

mod cluster;
mod memory;
mod redis;
mod script;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::redis::RedisNode;
pub use cluster::{HashRing, Shard, ShardedStore};
pub use memory::{InMemoryNode, NodeStats};
pub use script::{Script, CAS_SCRIPT};

/// A single key-value node.
#[async_trait]
pub trait KvNode: Send + Sync {
    /// Read many keys in one round trip. The result has one slot per key,
    /// in input order.
    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Write a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Run a previously loaded script by hash. Fails with
    /// [`crate::Error::ScriptNotLoaded`] when the node does not know it.
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<String>;

    /// Run a script by body; loads it on the node as a side effect.
    async fn eval(&self, body: &str, keys: &[String], args: &[String]) -> Result<String>;

    /// Human readable node address, used in logs.
    fn address(&self) -> &str;
}
