//! Batch coordinator
//!
//! Futures added to a batch are resolved together in a bounded number of
//! round trips, however many futures and shared dependencies there are:
//!
//! ```text
//!   add(f1) add(f2) ... add(fn)
//!            |
//!   execute: union of dependency keys ---> 1 x GetVersions
//!            final key per future
//!            keys not in scope cache  ---> 1 x GetMulti
//!            resolve f1..fn in order (misses compute + write)
//! ```
//!
//! Versions are read once, when the batch executes. A future invalidating a
//! dependency while the batch runs does not change the keys of the others.

use serde_json::Value;
use tracing::{debug, instrument};

use super::future::{FutureHandle, MemoFuture};
use super::scope::Scope;
use crate::engine::Engine;
use crate::error::Result;

/// Collects futures for one combined resolution
pub struct Batch<'a> {
    engine: &'a Engine,
    scope: &'a Scope,
    pending: Vec<(MemoFuture, FutureHandle)>,
}

impl std::fmt::Debug for Batch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<'a> Batch<'a> {
    pub(crate) fn open(engine: &'a Engine, scope: &'a Scope) -> Result<Self> {
        scope.open_batch()?;
        Ok(Self {
            engine,
            scope,
            pending: Vec::new(),
        })
    }

    /// Queue a future. Its handle resolves when the batch executes.
    pub fn add(&mut self, future: MemoFuture) -> FutureHandle {
        let handle = FutureHandle::new();
        self.pending.push((future, handle.clone()));
        handle
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Resolve every queued future. Results come back in the order the
    /// futures were added; the first failing computation aborts the rest.
    #[instrument(skip_all, fields(futures = self.pending.len()))]
    pub async fn execute(mut self) -> Result<Vec<Value>> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let (engine, scope) = (self.engine, self.scope);

        if scope.is_bypassed() {
            return compute_all(engine, pending).await;
        }

        let mut keys: Vec<String> = pending
            .iter()
            .flat_map(|(future, _)| future.dependency_keys())
            .collect();
        keys.sort();
        keys.dedup();

        let versions = match engine.resolve_versions(scope, &keys).await {
            Ok(versions) => versions,
            Err(e) if e.is_transient() => {
                engine.fail_open(scope, e)?;
                return compute_all(engine, pending).await;
            }
            Err(e) => return Err(e),
        };

        let final_keys: Vec<Option<String>> = pending
            .iter()
            .map(|(future, _)| engine.final_cache_key(future, &versions))
            .collect();

        let mut reads: Vec<String> = final_keys
            .iter()
            .flatten()
            .filter(|key| scope.cached_result(key).is_none())
            .cloned()
            .collect();
        reads.sort();
        reads.dedup();
        let prefetched = engine.read_many(scope, &reads).await?;
        debug!(
            dependencies = keys.len(),
            reads = reads.len(),
            "batch prefetch complete"
        );

        let mut results = Vec::with_capacity(pending.len());
        for ((future, handle), key) in pending.into_iter().zip(final_keys) {
            let value = match key {
                Some(key) => engine.resolve(scope, future, key, Some(&prefetched)).await?,
                None => engine.compute_uncached(future).await?,
            };
            handle.resolve(value.clone());
            results.push(value);
        }
        Ok(results)
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        self.scope.close_batch();
    }
}

async fn compute_all(engine: &Engine, pending: Vec<(MemoFuture, FutureHandle)>) -> Result<Vec<Value>> {
    let mut results = Vec::with_capacity(pending.len());
    for (future, handle) in pending {
        let value = engine.compute_uncached(future).await?;
        handle.resolve(value.clone());
        results.push(value);
    }
    Ok(results)
}

// =============================================================================
// Tests
// =============================================================================
