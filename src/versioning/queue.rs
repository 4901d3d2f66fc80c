//! Invalidation Queue
//!
//! Shared FIFO of version bumps. A drain pops every queued task and applies
//! it through the version CAS. Tasks failing with a transient error are put
//! back at the end of the drain, so they are retried by the next drain rather
//! than immediately (no busy loop during an outage).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use tokio::runtime::Handle;
use tracing::{debug, error, instrument, warn};

use super::version_store::{new_version, Version, VersionStore};
use crate::error::Result;

/// A pending version bump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub key: String,
    pub desired_version: Version,
    /// Empty when no previous version is expected
    pub expected_previous_version: Version,
    /// Fixed at creation so retries reuse it
    pub version_on_mismatch: Version,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl Task {
    pub fn new(
        key: impl Into<String>,
        desired_version: impl Into<Version>,
        expected_previous_version: impl Into<Version>,
    ) -> Self {
        Self {
            key: key.into(),
            desired_version: desired_version.into(),
            expected_previous_version: expected_previous_version.into(),
            version_on_mismatch: new_version(),
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Outcome of one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks whose bump was applied
    pub applied: usize,
    /// Tasks requeued after a transient failure
    pub requeued: usize,
}

/// Thread-safe queue of version bumps
pub struct InvalidationQueue {
    tasks: SegQueue<Task>,
    versions: Arc<VersionStore>,
    executor: Option<Handle>,
    applied: AtomicU64,
    requeued: AtomicU64,
}

impl InvalidationQueue {
    /// Create a queue. With an executor, [`drain`](Self::drain) is
    /// fire-and-forget on that runtime; without one it runs inline.
    pub fn new(versions: Arc<VersionStore>, executor: Option<Handle>) -> Self {
        Self {
            tasks: SegQueue::new(),
            versions,
            executor,
            applied: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        }
    }

    /// Queue a bump of `key` to `version`, expected to currently be at
    /// `expected_previous` ("" for absent).
    pub fn enqueue_bump(&self, key: &str, version: &str, expected_previous: &str) {
        self.push(Task::new(key, version, expected_previous));
    }

    pub fn push(&self, task: Task) {
        debug!(key = %task.key, "invalidation enqueued");
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Total bumps applied since creation
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Total tasks requeued since creation
    pub fn requeued_count(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Apply every queued task now.
    ///
    /// Transient failures are requeued for the next drain. Any other error
    /// is fatal: tasks not yet attempted stay queued and the error is
    /// returned.
    #[instrument(skip(self), fields(queued = self.tasks.len()))]
    pub async fn drain_now(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut retry = Vec::new();

        let batch: Vec<Task> = std::iter::from_fn(|| self.tasks.pop()).collect();
        let mut pending = batch.into_iter();

        while let Some(mut task) = pending.next() {
            task.attempts += 1;
            let result = self
                .versions
                .bump_version_with(
                    &task.key,
                    &task.desired_version,
                    &task.expected_previous_version,
                    &task.version_on_mismatch,
                )
                .await;

            match result {
                Ok(applied) => {
                    debug!(key = %task.key, version = %applied, "version bumped");
                    report.applied += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(key = %task.key, attempts = task.attempts, error = %e, "bump failed, will retry");
                    retry.push(task);
                }
                Err(e) => {
                    error!(key = %task.key, error = %e, "bump failed fatally");
                    self.applied.fetch_add(report.applied as u64, Ordering::Relaxed);
                    retry.push(task);
                    self.requeue(retry);
                    // Never attempted, so not counted as retries
                    for task in pending {
                        self.tasks.push(task);
                    }
                    return Err(e);
                }
            }
        }

        report.requeued = retry.len();
        self.applied.fetch_add(report.applied as u64, Ordering::Relaxed);
        self.requeue(retry);
        Ok(report)
    }

    fn requeue(&self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.requeued.fetch_add(1, Ordering::Relaxed);
            self.tasks.push(task);
        }
    }

    /// Drain on the configured executor, or inline when there is none.
    pub async fn drain(self: &Arc<Self>) -> Result<()> {
        match &self.executor {
            Some(handle) => {
                let queue = Arc::clone(self);
                handle.spawn(async move {
                    if let Err(e) = queue.drain_now().await {
                        error!(error = %e, "background invalidation drain failed");
                    }
                });
                Ok(())
            }
            None => self.drain_now().await.map(|_| ()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
