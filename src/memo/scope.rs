//! Request-scoped local caches
//!
//! A [`Scope`] models one unit of work (one inbound request, one job). It
//! carries:
//!
//! - a result cache, final cache key to value
//! - the versions observed or staged in this scope
//! - a dependency-extraction cache, call identity to dependency graph
//! - the transient-failure budget; once spent, every later operation in the
//!   scope bypasses the cache
//! - the open-batch flag
//!
//! Scopes are not shared between units of work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::versioning::LocalVersions;

/// Which local caches a scope keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Cache results and observed versions
    pub local_results: bool,
    /// Cache dependency graphs per call identity
    pub dependency_cache: bool,
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self {
            local_results: true,
            dependency_cache: true,
        }
    }
}

impl ScopeOptions {
    /// No local caching at all
    pub fn disabled() -> Self {
        Self {
            local_results: false,
            dependency_cache: false,
        }
    }
}

/// Caches and budgets for one unit of work
#[derive(Debug)]
pub struct Scope {
    options: ScopeOptions,
    results: Mutex<HashMap<String, Value>>,
    versions: Arc<LocalVersions>,
    dependencies: Mutex<HashMap<String, DependencyGraph>>,
    max_connection_attempts: u32,
    failures: AtomicU32,
    batch_open: AtomicBool,
}

impl Scope {
    pub fn new(max_connection_attempts: u32) -> Self {
        Self::with_options(max_connection_attempts, ScopeOptions::default())
    }

    pub fn with_options(max_connection_attempts: u32, options: ScopeOptions) -> Self {
        Self {
            options,
            results: Mutex::new(HashMap::new()),
            versions: Arc::new(LocalVersions::new()),
            dependencies: Mutex::new(HashMap::new()),
            max_connection_attempts,
            failures: AtomicU32::new(0),
            batch_open: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> ScopeOptions {
        self.options
    }

    // =========================================================================
    // Result cache
    // =========================================================================

    pub fn cached_result(&self, key: &str) -> Option<Value> {
        if !self.options.local_results {
            return None;
        }
        self.results.lock().get(key).cloned()
    }

    pub fn remember_result(&self, key: &str, value: &Value) {
        if self.options.local_results {
            self.results.lock().insert(key.to_string(), value.clone());
        }
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().len()
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// Version cache handed to transaction staging; `None` when local
    /// caching is off.
    pub fn local_versions(&self) -> Option<&Arc<LocalVersions>> {
        self.options.local_results.then_some(&self.versions)
    }

    pub fn cached_version(&self, key: &str) -> Option<String> {
        self.local_versions()?.get(key)
    }

    pub fn remember_versions(&self, entries: impl IntoIterator<Item = (String, String)>) {
        if let Some(local) = self.local_versions() {
            local.extend(entries);
        }
    }

    pub fn forget_version(&self, key: &str) {
        self.versions.remove(key);
    }

    // =========================================================================
    // Dependency-extraction cache
    // =========================================================================

    pub fn cached_dependencies(&self, call_key: &str) -> Option<DependencyGraph> {
        if !self.options.dependency_cache {
            return None;
        }
        self.dependencies.lock().get(call_key).cloned()
    }

    pub fn remember_dependencies(&self, call_key: String, graph: &DependencyGraph) {
        if self.options.dependency_cache {
            self.dependencies.lock().insert(call_key, graph.clone());
        }
    }

    // =========================================================================
    // Failure budget
    // =========================================================================

    /// Count one transient failure. Returns true once the budget is spent.
    pub fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        let bypassed = failures >= self.max_connection_attempts;
        if bypassed && failures == self.max_connection_attempts {
            warn!(
                failures,
                "connection attempts exhausted, bypassing cache for the rest of this scope"
            );
        }
        bypassed
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// True once the failure budget is spent
    pub fn is_bypassed(&self) -> bool {
        self.failures() >= self.max_connection_attempts
    }

    // =========================================================================
    // Batch flag
    // =========================================================================

    pub(crate) fn open_batch(&self) -> Result<()> {
        if self.batch_open.swap(true, Ordering::SeqCst) {
            return Err(Error::NestedBatch);
        }
        Ok(())
    }

    pub(crate) fn close_batch(&self) {
        self.batch_open.store(false, Ordering::SeqCst);
    }

    pub fn in_batch(&self) -> bool {
        self.batch_open.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tests
// =============================================================================
