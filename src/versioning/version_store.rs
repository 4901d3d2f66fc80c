//! Version Store
//!
//! Versions are opaque UUID tokens stored under each dependency node's cache
//! key. Only the latest token exists; a key without one is uninitialised.
//!
//! Bumps go through a single server-side compare-and-swap:
//!
//! ```text
//! actual = GET(key)
//! if (actual == nil && expected == "") || actual == expected:
//!     new = desired
//! else:
//!     new = on_mismatch        (fresh, generated by the caller)
//! SET(key, new [PX ttl]); return new
//! ```
//!
//! Two writers racing from the same previous version: the first gets its
//! desired version, the second ends on a brand-new version, so no reader can
//! see one token standing for two different post-write states.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{ShardedStore, CAS_SCRIPT};

/// Opaque version token
pub type Version = String;

/// Generate a version never seen before.
pub fn new_version() -> Version {
    Uuid::new_v4().to_string()
}

/// Batched version reads and atomic version bumps
pub struct VersionStore {
    store: Arc<ShardedStore>,
    ttl: Option<Duration>,
}

impl VersionStore {
    /// Create a version store; `ttl` is applied on every bump.
    pub fn new(store: Arc<ShardedStore>, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }

    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    /// Read the versions of `keys` in one round trip. Keys without a stored
    /// version are absent from the result.
    #[instrument(skip_all, fields(count = keys.len()))]
    pub async fn get_versions(&self, keys: &[String]) -> Result<HashMap<String, Version>> {
        let values = self.store.get_multi(keys).await?;
        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect())
    }

    /// Bump `key` to `desired` if it is still at `expected_previous` (empty
    /// string: "expected absent"); otherwise to a fresh version. Returns the
    /// version the key ends on.
    pub async fn bump_version(
        &self,
        key: &str,
        desired: &str,
        expected_previous: &str,
    ) -> Result<Version> {
        self.bump_version_with(key, desired, expected_previous, &new_version())
            .await
    }

    /// Like [`bump_version`](Self::bump_version) with a caller-supplied
    /// mismatch version, so a retried bump reuses the same token.
    #[instrument(skip(self))]
    pub async fn bump_version_with(
        &self,
        key: &str,
        desired: &str,
        expected_previous: &str,
        on_mismatch: &str,
    ) -> Result<Version> {
        let ttl_ms = self.ttl.map_or(0, |ttl| ttl.as_millis() as u64);
        let args = [
            expected_previous.to_string(),
            desired.to_string(),
            on_mismatch.to_string(),
            ttl_ms.to_string(),
        ];
        let applied = self
            .store
            .run_script(&CAS_SCRIPT, &[key.to_string()], &args)
            .await?;

        if applied != desired {
            debug!(key, expected_previous, "version CAS mismatch, using fresh version");
        }
        Ok(applied)
    }
}

// =============================================================================
// Tests
// =============================================================================
