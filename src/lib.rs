//! verscache - Version-Addressable Caching Engine
//!
//! Results are stored under keys derived from the *current versions* of the
//! dependencies they were computed from. Invalidating a dependency advances
//! its version; every result keyed to the old version becomes unreachable
//! without deleting anything.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              Engine                                │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  Memoized / MemoFuture / Batch        Scope (per unit of work)     │
//! │            │                           results, versions, graphs   │
//! │            ▼                                                       │
//! │  DependencyGraph ──▶ VersionStore ──▶ final key ──▶ ShardedStore   │
//! │                          ▲                           (KvNode x N)  │
//! │  invalidate ──▶ TransactionStaging ──▶ InvalidationQueue ──┘       │
//! │                 (MVCC, commit/rollback)   (CAS bumps, retries)     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] - Engine configuration and hooks
//! - [`engine`] - Call resolution, invalidation and shutdown
//! - [`error`] - Error types
//! - [`graph`] - Dependency nodes and graph expansion
//! - [`memo`] - Scopes, futures, batches and the typed decorator
//! - [`store`] - Backing-store nodes, sharding and the CAS script
//! - [`versioning`] - Version store, invalidation queue, transaction staging

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod memo;
pub mod store;
pub mod versioning;

// Re-export commonly used types
pub use config::{EngineConfig, Hooks, OutOfDate};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use graph::{
    DependencyBuilder, DependencyGraph, EntityKind, ExternalEntity, Memoizable,
    QueryPredicateExtractor,
};
pub use memo::{Batch, FutureHandle, MemoFuture, Memoized, Scope, ScopeOptions};
pub use store::{InMemoryNode, KvNode, RedisNode, Shard, ShardedStore};
pub use versioning::{ManualTransactions, NoTransactions, TransactionCoordinator, TransactionId};
