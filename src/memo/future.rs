//! Memoized calls
//!
//! A [`MemoFuture`] is one pending call: who is called, how, what it depends
//! on and how to compute it on a miss. It holds no engine state; the engine
//! (single call) or a [`Batch`](super::Batch) resolves it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::graph::{canonical_json, hex_digest, DependencyGraph, Props};
use crate::versioning::Version;

/// Deferred computation run on a cache miss
pub type Computation = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

/// Per-method overrides of engine defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodOptions {
    pub ttl: Option<Duration>,
    pub validation_sample_pct: Option<f64>,
}

/// One pending memoized call
pub struct MemoFuture {
    receiver_id: String,
    method_id: String,
    args: Value,
    dependencies: Option<DependencyGraph>,
    options: MethodOptions,
    computation: Computation,
}

impl MemoFuture {
    /// A call with declared dependencies. `args` must be the serialized call
    /// arguments.
    pub fn new(
        method_id: impl Into<String>,
        args: Value,
        dependencies: DependencyGraph,
        computation: Computation,
    ) -> Self {
        Self {
            receiver_id: String::new(),
            method_id: method_id.into(),
            args,
            dependencies: Some(dependencies),
            options: MethodOptions::default(),
            computation,
        }
    }

    /// A pure call, keyed on its arguments alone.
    pub fn pure(method_id: impl Into<String>, args: Value, computation: Computation) -> Self {
        Self {
            receiver_id: String::new(),
            method_id: method_id.into(),
            args,
            dependencies: None,
            options: MethodOptions::default(),
            computation,
        }
    }

    pub fn with_receiver(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = receiver_id.into();
        self
    }

    pub fn with_options(mut self, options: MethodOptions) -> Self {
        self.options = options;
        self
    }

    pub fn method_id(&self) -> &str {
        &self.method_id
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    pub fn options(&self) -> &MethodOptions {
        &self.options
    }

    /// None for a pure call
    pub fn dependencies(&self) -> Option<&DependencyGraph> {
        self.dependencies.as_ref()
    }

    /// Dependency cache keys, sorted; empty for a pure call.
    pub fn dependency_keys(&self) -> Vec<String> {
        self.dependencies
            .as_ref()
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Checksum component of the final cache key.
    ///
    /// Hashes the sorted `{cache_key: version}` map of the dependencies
    /// together with the call identity (receiver and arguments). A pure call
    /// hashes the call identity only. Returns `None` when a dependency has
    /// no entry in `versions`.
    pub fn checksum(&self, versions: &HashMap<String, Version>) -> Option<String> {
        let call = json!([self.receiver_id, self.args]);
        let Some(graph) = &self.dependencies else {
            return Some(hex_digest(&json!({ "call": call }).to_string()));
        };

        let mut resolved = Props::new();
        for key in graph.keys() {
            resolved.insert(key.clone(), Value::String(versions.get(key)?.clone()));
        }
        let mut material = Props::new();
        material.insert("call".into(), call);
        material.insert("deps".into(), Value::String(canonical_json(&resolved)));
        Some(hex_digest(&canonical_json(&material)))
    }

    /// Run the underlying computation.
    pub(crate) async fn compute(self) -> Result<Value> {
        Ok((self.computation)().await?)
    }

    /// Split off the computation, keeping the call metadata.
    pub(crate) fn into_parts(self) -> (CallInfo, Computation) {
        (
            CallInfo {
                method_id: self.method_id,
                options: self.options,
            },
            self.computation,
        )
    }
}

impl fmt::Debug for MemoFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoFuture")
            .field("method_id", &self.method_id)
            .field("receiver_id", &self.receiver_id)
            .field("args", &self.args)
            .field("dependencies", &self.dependencies.as_ref().map(DependencyGraph::len))
            .finish_non_exhaustive()
    }
}

/// Call metadata kept while the computation runs
#[derive(Debug, Clone)]
pub(crate) struct CallInfo {
    pub method_id: String,
    pub options: MethodOptions,
}

// =============================================================================
// Handles
// =============================================================================

/// Result slot of a future added to a batch
#[derive(Debug, Clone, Default)]
pub struct FutureHandle {
    slot: Arc<OnceCell<Value>>,
}

impl FutureHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn resolve(&self, value: Value) {
        let _ = self.slot.set(value);
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.get().is_some()
    }

    /// The result; [`Error::FutureNotResolved`] before the batch executed.
    pub fn value(&self) -> Result<Value> {
        self.slot.get().cloned().ok_or(Error::FutureNotResolved)
    }

    /// The result decoded as `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value()?)?)
    }
}

// =============================================================================
// Tests
// =============================================================================
