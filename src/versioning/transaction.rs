//! Transaction-scoped version staging (MVCC)
//!
//! Inside a host transaction, an invalidation does not bump the store. The
//! desired version is staged: this process computes checksums with it right
//! away, so results cached during the transaction are keyed to a version no
//! other process (and no other transaction) knows about yet. On commit the
//! staged bumps are queued and drained. On rollback they are discarded,
//! leaving anything written under them permanently unreachable.
//!
//! Each outstanding transaction owns its own stage, created on its first
//! staged bump together with that transaction's commit and rollback hooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::local::LocalVersions;
use super::queue::{InvalidationQueue, Task};
use super::version_store::Version;
use crate::error::{Error, Result};

/// Callback run by the coordinator when a transaction ends
pub type TransactionHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Identifies one host transaction
pub type TransactionId = u64;

/// Host transaction coordinator
pub trait TransactionCoordinator: Send + Sync {
    /// Transaction the caller is currently in, if any.
    fn current_transaction(&self) -> Option<TransactionId>;

    fn in_transaction(&self) -> bool {
        self.current_transaction().is_some()
    }

    /// Run `hook` once if transaction `tx` commits.
    fn on_commit(&self, tx: TransactionId, hook: TransactionHook);

    /// Run `hook` once if transaction `tx` rolls back.
    fn on_rollback(&self, tx: TransactionId, hook: TransactionHook);
}

/// Coordinator for hosts without transactions
#[derive(Debug, Default)]
pub struct NoTransactions;

impl TransactionCoordinator for NoTransactions {
    fn current_transaction(&self) -> Option<TransactionId> {
        None
    }

    fn on_commit(&self, _tx: TransactionId, _hook: TransactionHook) {}

    fn on_rollback(&self, _tx: TransactionId, _hook: TransactionHook) {}
}

#[derive(Default)]
struct OpenTransaction {
    commit_hooks: Vec<TransactionHook>,
    rollback_hooks: Vec<TransactionHook>,
}

/// Explicitly driven coordinator: `begin`, then `commit` or `rollback`.
///
/// At most one transaction is current at a time, but several may be open:
/// [`suspend`](Self::suspend) detaches the current one without ending it and
/// [`resume`](Self::resume) makes it current again.
#[derive(Default)]
pub struct ManualTransactions {
    next_id: AtomicU64,
    open: Mutex<HashMap<TransactionId, OpenTransaction>>,
    current: Mutex<Option<TransactionId>>,
}

impl ManualTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction and make it current. Nested begins are a usage
    /// error.
    pub fn begin(&self) -> Result<TransactionId> {
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(Error::Config("transaction already open".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.open.lock().insert(id, OpenTransaction::default());
        *current = Some(id);
        Ok(id)
    }

    /// Detach the current transaction, leaving it open.
    pub fn suspend(&self) -> Option<TransactionId> {
        self.current.lock().take()
    }

    /// Make the open transaction `id` current again.
    pub fn resume(&self, id: TransactionId) -> Result<()> {
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(Error::Config("transaction already open".to_string()));
        }
        if !self.open.lock().contains_key(&id) {
            return Err(Error::Config(format!("transaction {} is not open", id)));
        }
        *current = Some(id);
        Ok(())
    }

    /// Commit the current transaction and run its commit hooks in
    /// registration order.
    pub async fn commit(&self) {
        let Some(tx) = self.finish() else {
            return;
        };
        for hook in tx.commit_hooks {
            hook().await;
        }
    }

    /// Roll back the current transaction and run its rollback hooks in
    /// registration order.
    pub async fn rollback(&self) {
        let Some(tx) = self.finish() else {
            return;
        };
        for hook in tx.rollback_hooks {
            hook().await;
        }
    }

    fn finish(&self) -> Option<OpenTransaction> {
        let id = self.current.lock().take()?;
        self.open.lock().remove(&id)
    }
}

impl TransactionCoordinator for ManualTransactions {
    fn current_transaction(&self) -> Option<TransactionId> {
        *self.current.lock()
    }

    fn on_commit(&self, tx: TransactionId, hook: TransactionHook) {
        if let Some(open) = self.open.lock().get_mut(&tx) {
            open.commit_hooks.push(hook);
        }
    }

    fn on_rollback(&self, tx: TransactionId, hook: TransactionHook) {
        if let Some(open) = self.open.lock().get_mut(&tx) {
            open.rollback_hooks.push(hook);
        }
    }
}

// =============================================================================
// Staging
// =============================================================================

#[derive(Debug, Clone)]
struct StagedBump {
    version: Version,
    previous: Version,
}

/// Staged bumps of one outstanding transaction
#[derive(Default)]
struct Stage {
    bumps: Mutex<HashMap<String, StagedBump>>,
    locals: Mutex<Vec<Weak<LocalVersions>>>,
}

impl Stage {
    fn forget_locals<'a>(&self, keys: impl IntoIterator<Item = &'a String> + Clone) {
        for local in self.locals.lock().drain(..) {
            if let Some(local) = local.upgrade() {
                local.remove_all(keys.clone());
            }
        }
    }
}

type Stages = Arc<Mutex<HashMap<TransactionId, Arc<Stage>>>>;

/// Where a bump went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpDisposition {
    /// Queued for the store
    Queued,
    /// Held until the transaction commits
    Staged,
}

/// Routes bumps to the invalidation queue or to the current transaction's
/// stage
pub struct TransactionStaging {
    coordinator: Arc<dyn TransactionCoordinator>,
    queue: Arc<InvalidationQueue>,
    stages: Stages,
}

impl TransactionStaging {
    pub fn new(coordinator: Arc<dyn TransactionCoordinator>, queue: Arc<InvalidationQueue>) -> Self {
        Self {
            coordinator,
            queue,
            stages: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.coordinator.in_transaction()
    }

    pub fn queue(&self) -> &Arc<InvalidationQueue> {
        &self.queue
    }

    /// Queue a bump, or stage it when a transaction is current. A staged
    /// version is also written into `local` so the caller's scope sees it
    /// immediately.
    ///
    /// Staging a key twice in one transaction keeps the first previous
    /// version and the latest desired version.
    pub fn enqueue_bump(
        &self,
        key: &str,
        version: &str,
        previous: &str,
        local: Option<&Arc<LocalVersions>>,
    ) -> BumpDisposition {
        let Some(tx) = self.coordinator.current_transaction() else {
            self.queue.enqueue_bump(key, version, previous);
            return BumpDisposition::Queued;
        };

        let stage = self.stage_for(tx);
        stage
            .bumps
            .lock()
            .entry(key.to_string())
            .and_modify(|b| b.version = version.to_string())
            .or_insert_with(|| StagedBump {
                version: version.to_string(),
                previous: previous.to_string(),
            });
        if let Some(local) = local {
            local.insert(key, version);
            stage.locals.lock().push(Arc::downgrade(local));
        }
        debug!(key, version, tx, "version bump staged");
        BumpDisposition::Staged
    }

    /// Version staged for `key` in the current transaction, if any.
    pub fn staged_version(&self, key: &str) -> Option<Version> {
        let stage = self.current_stage()?;
        let bumps = stage.bumps.lock();
        bumps.get(key).map(|b| b.version.clone())
    }

    /// Number of bumps staged in the current transaction
    pub fn staged_len(&self) -> usize {
        self.current_stage()
            .map_or(0, |stage| stage.bumps.lock().len())
    }

    /// Number of transactions holding staged bumps
    pub fn open_stages(&self) -> usize {
        self.stages.lock().len()
    }

    fn current_stage(&self) -> Option<Arc<Stage>> {
        let tx = self.coordinator.current_transaction()?;
        self.stages.lock().get(&tx).cloned()
    }

    /// The stage of transaction `tx`, creating it (and registering its
    /// commit and rollback hooks) on first use.
    fn stage_for(&self, tx: TransactionId) -> Arc<Stage> {
        let stage = {
            let mut stages = self.stages.lock();
            if let Some(stage) = stages.get(&tx) {
                return stage.clone();
            }
            let stage = Arc::new(Stage::default());
            stages.insert(tx, stage.clone());
            stage
        };

        let on_commit = {
            let stages = self.stages.clone();
            let queue = self.queue.clone();
            Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    let Some(stage) = stages.lock().remove(&tx) else {
                        return;
                    };
                    let bumps: Vec<(String, StagedBump)> = stage.bumps.lock().drain().collect();
                    stage.forget_locals(bumps.iter().map(|(key, _)| key));
                    info!(tx, count = bumps.len(), "transaction committed, applying staged bumps");
                    for (key, bump) in bumps {
                        queue.push(Task::new(key, bump.version, bump.previous));
                    }
                    if let Err(e) = queue.drain().await {
                        error!(tx, error = %e, "draining committed bumps failed");
                    }
                })
            })
        };

        let on_rollback = {
            let stages = self.stages.clone();
            Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    let Some(stage) = stages.lock().remove(&tx) else {
                        return;
                    };
                    let bumps: Vec<String> = stage.bumps.lock().drain().map(|(key, _)| key).collect();
                    stage.forget_locals(bumps.iter());
                    info!(tx, count = bumps.len(), "transaction rolled back, staged bumps discarded");
                })
            })
        };

        self.coordinator.on_commit(tx, on_commit);
        self.coordinator.on_rollback(tx, on_rollback);
        stage
    }
}

// =============================================================================
// Tests
// =============================================================================
