//! Versioned Cache Engine
//!
//! The engine owns the backing store, the version store, the invalidation
//! queue and transaction staging, and resolves memoized calls against them.
//!
//! ```text
//!   call(scope, future)
//!        |
//!        v
//!   resolve versions ---- scope cache / staged / GetVersions / init
//!        |
//!        v
//!   final key = namespace:method:global_version:checksum
//!        |
//!        v
//!   scope result cache -> store read -> hit? (sampled validation)
//!        |                                 |
//!        | miss                            v
//!        v                              return cached
//!   compute -> write back (best effort) -> return
//! ```
//!
//! Transient store errors never fail a call: they are reported through
//! [`Hooks::on_error`], counted against the scope's budget and the call
//! proceeds uncached, unless `raise_on_error` is set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{EngineConfig, Hooks, OutOfDate};
use crate::error::{Error, Result};
use crate::graph::Memoizable;
use crate::memo::{
    Batch, EngineStats, MemoFuture, MethodOptions, Scope, ScopeOptions, StatsSnapshot,
};
use crate::store::ShardedStore;
use crate::versioning::{
    new_version, BumpDisposition, InvalidationQueue, NoTransactions, TransactionCoordinator,
    TransactionStaging, Version, VersionStore,
};

/// Builder for [`Engine`]
pub struct EngineBuilder {
    store: ShardedStore,
    config: EngineConfig,
    hooks: Hooks,
    coordinator: Arc<dyn TransactionCoordinator>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let store = Arc::new(self.store.with_replica_reads(self.config.replica_reads));
        let versions = Arc::new(VersionStore::new(store.clone(), self.config.version_ttl));
        let queue = Arc::new(InvalidationQueue::new(
            versions.clone(),
            self.config.executor.clone(),
        ));
        let staging = TransactionStaging::new(self.coordinator, queue.clone());

        info!(
            namespace = %self.config.namespace,
            shards = store.shard_count(),
            "cache engine ready"
        );

        Ok(Engine {
            config: self.config,
            hooks: self.hooks,
            store,
            versions,
            queue,
            staging,
            stats: EngineStats::new(),
        })
    }
}

/// Versioned cache engine
pub struct Engine {
    config: EngineConfig,
    hooks: Hooks,
    store: Arc<ShardedStore>,
    versions: Arc<VersionStore>,
    queue: Arc<InvalidationQueue>,
    staging: TransactionStaging,
    stats: EngineStats,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(store: ShardedStore) -> EngineBuilder {
        EngineBuilder {
            store,
            config: EngineConfig::default(),
            hooks: Hooks::default(),
            coordinator: Arc::new(NoTransactions),
        }
    }

    /// Engine with default config, hooks and no transactions.
    pub fn new(store: ShardedStore) -> Result<Self> {
        Self::builder(store).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    pub fn queue(&self) -> &Arc<InvalidationQueue> {
        &self.queue
    }

    pub fn in_transaction(&self) -> bool {
        self.staging.in_transaction()
    }

    /// New unit-of-work scope with both local caches on.
    pub fn scope(&self) -> Scope {
        Scope::new(self.config.max_connection_attempts)
    }

    pub fn scope_with(&self, options: ScopeOptions) -> Scope {
        Scope::with_options(self.config.max_connection_attempts, options)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            bumps_applied: self.queue.applied_count(),
            bumps_requeued: self.queue.requeued_count(),
            ..self.stats.snapshot()
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Resolve one memoized call.
    #[instrument(skip_all, fields(method = %future.method_id()))]
    pub async fn call(&self, scope: &Scope, future: MemoFuture) -> Result<Value> {
        if scope.is_bypassed() {
            return self.compute_uncached(future).await;
        }

        let versions = match self.resolve_versions(scope, &future.dependency_keys()).await {
            Ok(versions) => versions,
            Err(e) if e.is_transient() => {
                self.fail_open(scope, e)?;
                return self.compute_uncached(future).await;
            }
            Err(e) => return Err(e),
        };

        match self.final_cache_key(&future, &versions) {
            Some(key) => self.resolve(scope, future, key, None).await,
            None => self.compute_uncached(future).await,
        }
    }

    /// Open a batch on `scope`. Only one batch may be open per scope.
    pub fn batch<'a>(&'a self, scope: &'a Scope) -> Result<Batch<'a>> {
        Batch::open(self, scope)
    }

    /// `namespace:method_id:global_cache_version:checksum`
    pub(crate) fn final_cache_key(
        &self,
        future: &MemoFuture,
        versions: &HashMap<String, Version>,
    ) -> Option<String> {
        let checksum = future.checksum(versions)?;
        Some(format!(
            "{}:{}:{}:{}",
            self.config.namespace,
            future.method_id(),
            self.config.global_cache_version,
            checksum
        ))
    }

    /// Current versions of `keys`.
    ///
    /// Staged versions of an open transaction come first, then the scope's
    /// cache, then one store read for the rest. A key with no stored version
    /// gets a fresh version right away; storing it (a CAS expecting no
    /// previous version) goes through the invalidation queue, drained once
    /// for all such keys. Losing that CAS to another process only orphans
    /// results cached under the version generated here.
    #[instrument(skip_all, fields(count = keys.len()))]
    pub(crate) async fn resolve_versions(
        &self,
        scope: &Scope,
        keys: &[String],
    ) -> Result<HashMap<String, Version>> {
        let mut resolved = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();

        for key in keys {
            if let Some(version) = self
                .staging
                .staged_version(key)
                .or_else(|| scope.cached_version(key))
            {
                resolved.insert(key.clone(), version);
            } else {
                missing.push(key.clone());
            }
        }
        if missing.is_empty() {
            return Ok(resolved);
        }

        let mut fetched = self.versions.get_versions(&missing).await?;
        let mut initialised = 0;
        for key in &missing {
            if !fetched.contains_key(key) {
                let version = new_version();
                debug!(key = %key, version = %version, "version initialised");
                self.queue.enqueue_bump(key, &version, "");
                fetched.insert(key.clone(), version);
                initialised += 1;
            }
        }

        scope.remember_versions(fetched.iter().map(|(k, v)| (k.clone(), v.clone())));
        resolved.extend(fetched);

        if initialised > 0 {
            self.queue.drain().await?;
        }
        Ok(resolved)
    }

    /// Read raw values for `keys` in one round trip. A transient failure
    /// yields an empty map, so every key resolves as a miss.
    pub(crate) async fn read_many(
        &self,
        scope: &Scope,
        keys: &[String],
    ) -> Result<HashMap<String, Option<String>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        match self.store.get_multi(keys).await {
            Ok(values) => Ok(keys.iter().cloned().zip(values).collect()),
            Err(e) if e.is_transient() => {
                self.fail_open(scope, e)?;
                Ok(HashMap::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a future whose final key is known. `prefetched` holds the
    /// batch's shared read; without it a single read is issued.
    pub(crate) async fn resolve(
        &self,
        scope: &Scope,
        future: MemoFuture,
        key: String,
        prefetched: Option<&HashMap<String, Option<String>>>,
    ) -> Result<Value> {
        let cached = match scope.cached_result(&key) {
            Some(value) => Some(value),
            None => match prefetched {
                Some(reads) => reads
                    .get(&key)
                    .cloned()
                    .flatten()
                    .and_then(|raw| decode(&key, &raw)),
                None => self.read(scope, &key).await?,
            },
        };

        let (info, computation) = future.into_parts();
        let ttl = info.options.ttl.or(self.config.default_ttl);

        let Some(cached) = cached else {
            self.stats.record_miss();
            debug!(key = %key, "cache miss");
            let value = computation().await?;
            self.write(scope, &key, &value, ttl).await?;
            scope.remember_result(&key, &value);
            return Ok(value);
        };

        self.stats.record_hit();
        if !self.should_validate(&info.options) {
            scope.remember_result(&key, &cached);
            return Ok(cached);
        }

        let fresh = computation().await?;
        let out_of_date = fresh != cached;
        self.stats.record_validation(out_of_date);
        if out_of_date {
            (self.hooks.on_out_of_date)(&OutOfDate {
                method_id: info.method_id,
                cache_key: key.clone(),
                cached,
                fresh: fresh.clone(),
            });
            self.write(scope, &key, &fresh, ttl).await?;
        }
        scope.remember_result(&key, &fresh);
        Ok(fresh)
    }

    pub(crate) async fn compute_uncached(&self, future: MemoFuture) -> Result<Value> {
        self.stats.record_bypass();
        future.compute().await
    }

    async fn read(&self, scope: &Scope, key: &str) -> Result<Option<Value>> {
        match self.store.get(key).await {
            Ok(raw) => Ok(raw.and_then(|raw| decode(key, &raw))),
            Err(e) if e.is_transient() => {
                self.fail_open(scope, e)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort write; skipped once the scope bypasses the cache.
    async fn write(
        &self,
        scope: &Scope,
        key: &str,
        value: &Value,
        ttl: Option<std::time::Duration>,
    ) -> Result<()> {
        if scope.is_bypassed() {
            return Ok(());
        }
        let raw = serde_json::to_string(value)?;
        match self.store.set(key, &raw, ttl).await {
            Ok(()) => {
                self.stats.record_write();
                Ok(())
            }
            Err(e) if e.is_transient() => self.fail_open(scope, e),
            Err(e) => Err(e),
        }
    }

    fn should_validate(&self, options: &MethodOptions) -> bool {
        let pct = options
            .validation_sample_pct
            .unwrap_or(self.config.validation_sample_pct);
        pct > 0.0 && rand::thread_rng().gen_range(0.0..100.0) < pct
    }

    /// Report a transient error and charge it to the scope. Returns the error
    /// only in raise-on-error mode.
    pub(crate) fn fail_open(&self, scope: &Scope, err: Error) -> Result<()> {
        self.stats.record_transient_error();
        scope.record_failure();
        (self.hooks.on_error)(&err);
        if self.config.raise_on_error {
            Err(err)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Invalidate `nodes`: every result depending on any of them, directly or
    /// transitively, becomes unreachable.
    ///
    /// Outside a transaction the bumps are queued and drained. Inside one
    /// they are staged: visible in this process at once, applied on commit.
    #[instrument(skip_all, fields(count = nodes.len()))]
    pub async fn invalidate(&self, scope: &Scope, nodes: &[Memoizable]) -> Result<()> {
        for node in nodes {
            node.validate()?;
        }
        let keys: Vec<String> = nodes
            .iter()
            .map(|n| n.cache_key().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        let previous = self.previous_versions(scope, &keys).await?;
        for key in &keys {
            let expected = previous.get(key).map(String::as_str).unwrap_or("");
            let version = new_version();
            match self
                .staging
                .enqueue_bump(key, &version, expected, scope.local_versions())
            {
                BumpDisposition::Staged => {}
                BumpDisposition::Queued => scope.forget_version(key),
            }
        }

        if self.staging.in_transaction() {
            return Ok(());
        }
        self.queue.drain().await
    }

    /// Versions the invalidated keys are expected to be at. A failed read
    /// leaves keys out, so their bump falls through to a fresh version.
    async fn previous_versions(
        &self,
        scope: &Scope,
        keys: &[String],
    ) -> Result<HashMap<String, Version>> {
        let mut previous = HashMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match scope.cached_version(key) {
                Some(version) => {
                    previous.insert(key.clone(), version);
                }
                None => missing.push(key.clone()),
            }
        }
        if missing.is_empty() || scope.is_bypassed() {
            return Ok(previous);
        }

        match self.versions.get_versions(&missing).await {
            Ok(fetched) => previous.extend(fetched),
            Err(e) if e.is_transient() => self.fail_open(scope, e)?,
            Err(e) => return Err(e),
        }
        Ok(previous)
    }

    /// Apply queued invalidations now.
    pub async fn drain(&self) -> Result<()> {
        self.queue.drain_now().await.map(|_| ())
    }

    /// Final best-effort drain. Failures are logged.
    pub async fn shutdown(&self) {
        match self.queue.drain_now().await {
            Ok(report) if report.requeued > 0 => {
                warn!(
                    applied = report.applied,
                    pending = report.requeued,
                    "shutdown drain left invalidations unapplied"
                );
            }
            Ok(report) => info!(applied = report.applied, "shutdown drain complete"),
            Err(e) => error!(error = %e, "shutdown drain failed"),
        }
    }
}

fn decode(key: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "undecodable cached value, treating as miss");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
