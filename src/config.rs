//! Engine configuration
//!
//! Values only: TTLs, retry budget, validation sampling, key namespace and
//! the optional async executor used to drain invalidations. Behavioural
//! hooks (error and out-of-date handlers) live in [`Hooks`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::error::{Error, Result};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// First component of every final cache key
    pub namespace: String,

    /// Global cache-key version; changing it orphans every cached result
    pub global_cache_version: String,

    /// TTL for cached results (None = no expiry)
    #[serde(with = "duration_ms")]
    pub default_ttl: Option<Duration>,

    /// TTL applied to version keys on every bump (None = no expiry)
    #[serde(with = "duration_ms")]
    pub version_ttl: Option<Duration>,

    /// Transient failures tolerated per scope before caching is bypassed
    pub max_connection_attempts: u32,

    /// Percentage (0-100) of cache hits that are recomputed and compared
    pub validation_sample_pct: f64,

    /// Propagate transient backing-store errors instead of failing open
    pub raise_on_error: bool,

    /// Load-balance plain reads across shard replicas
    pub replica_reads: bool,

    /// Executor for fire-and-forget invalidation drains
    #[serde(skip)]
    pub executor: Option<Handle>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "verscache".to_string(),
            global_cache_version: "1".to_string(),
            default_ttl: None,
            version_ttl: None,
            max_connection_attempts: 3,
            validation_sample_pct: 0.0,
            raise_on_error: false,
            replica_reads: true,
            executor: None,
        }
    }
}

impl EngineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from a YAML document.
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(doc).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_global_cache_version(mut self, version: impl Into<String>) -> Self {
        self.global_cache_version = version.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn with_version_ttl(mut self, ttl: Duration) -> Self {
        self.version_ttl = Some(ttl);
        self
    }

    pub fn with_max_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    pub fn with_validation_sample_pct(mut self, pct: f64) -> Self {
        self.validation_sample_pct = pct;
        self
    }

    pub fn with_raise_on_error(mut self, raise: bool) -> Self {
        self.raise_on_error = raise;
        self
    }

    /// Drain invalidations on the given runtime instead of inline.
    pub fn with_executor(mut self, handle: Handle) -> Self {
        self.executor = Some(handle);
        self
    }

    /// Reject values that would produce ambiguous keys or nonsensical sampling.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(Error::Config(format!(
                "namespace must be non-empty and must not contain ':' (got {:?})",
                self.namespace
            )));
        }
        if self.global_cache_version.contains(':') {
            return Err(Error::Config(format!(
                "global cache version must not contain ':' (got {:?})",
                self.global_cache_version
            )));
        }
        if !(0.0..=100.0).contains(&self.validation_sample_pct) {
            return Err(Error::Config(format!(
                "validation sample percentage must be within 0-100 (got {})",
                self.validation_sample_pct
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// Reported when a sampled validation finds a cached value differing from a
/// fresh computation.
#[derive(Debug, Clone)]
pub struct OutOfDate {
    pub method_id: String,
    pub cache_key: String,
    pub cached: serde_json::Value,
    pub fresh: serde_json::Value,
}

pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;
pub type OutOfDateHandler = Arc<dyn Fn(&OutOfDate) + Send + Sync>;

/// Observability hooks. Both default to logging.
#[derive(Clone)]
pub struct Hooks {
    pub on_error: ErrorHandler,
    pub on_out_of_date: OutOfDateHandler,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_error: Arc::new(|err| {
                tracing::warn!(error = %err, "backing store error, continuing uncached");
            }),
            on_out_of_date: Arc::new(|report| {
                tracing::error!(
                    method = %report.method_id,
                    key = %report.cache_key,
                    "cached value out of date"
                );
            }),
        }
    }
}

impl Hooks {
    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(f);
        self
    }

    pub fn on_out_of_date(mut self, f: impl Fn(&OutOfDate) + Send + Sync + 'static) -> Self {
        self.on_out_of_date = Arc::new(f);
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

/// Optional durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// =============================================================================
// Tests
// =============================================================================
