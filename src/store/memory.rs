//! In-memory node
//!
//! Process-local [`KvNode`] with the same observable semantics as a Redis
//! node for everything the engine uses: TTL expiry, `EVALSHA` failing with
//! "not loaded" until the body has been sent once, and the CAS script
//! executing atomically. Counters and fault injection make round trips and
//! outages assertable in tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::script::{CAS_SCRIPT, CAS_SCRIPT_BODY};
use super::KvNode;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Node operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// `get_multi` round trips
    pub reads: u64,
    /// Keys requested across all reads
    pub keys_read: u64,
    /// `set` round trips
    pub writes: u64,
    /// Scripts run by hash (successful or not)
    pub eval_shas: u64,
    /// Scripts run by body
    pub evals: u64,
    /// Injected failures returned
    pub failures: u64,
}

/// In-memory key-value node
pub struct InMemoryNode {
    address: String,
    data: DashMap<String, StoredValue>,
    loaded_scripts: RwLock<HashSet<String>>,
    fail_next: AtomicU32,
    down: AtomicBool,
    reads: AtomicU64,
    keys_read: AtomicU64,
    writes: AtomicU64,
    eval_shas: AtomicU64,
    evals: AtomicU64,
    failures: AtomicU64,
}

impl Default for InMemoryNode {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryNode {
    /// Create a new empty node
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            data: DashMap::new(),
            loaded_scripts: RwLock::new(HashSet::new()),
            fail_next: AtomicU32::new(0),
            down: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            keys_read: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            eval_shas: AtomicU64::new(0),
            evals: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Make the next `n` operations fail with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Simulate a sustained outage until called again with `false`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Forget every loaded script, like `SCRIPT FLUSH`.
    pub fn flush_scripts(&self) {
        self.loaded_scripts.write().clear();
    }

    /// Read a live value directly, bypassing counters and fault injection.
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.data
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone())
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|v| v.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            reads: self.reads.load(Ordering::Relaxed),
            keys_read: self.keys_read.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            eval_shas: self.eval_shas.load(Ordering::Relaxed),
            evals: self.evals.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn check_fault(&self) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.down.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Connection(format!(
                "{}: connection refused",
                self.address
            )));
        }
        Ok(())
    }

    /// Atomic compare-and-swap, executed under the key's shard lock.
    fn run_cas(&self, keys: &[String], args: &[String]) -> Result<String> {
        let (key, expected, desired, on_mismatch, ttl) = match (keys, args) {
            ([key], [expected, desired, on_mismatch, ttl]) => {
                (key, expected, desired, on_mismatch, ttl)
            }
            _ => {
                return Err(Error::Script(format!(
                    "CAS script expects 1 key and 4 args, got {} and {}",
                    keys.len(),
                    args.len()
                )))
            }
        };
        let ttl_ms: u64 = ttl
            .parse()
            .map_err(|_| Error::Script(format!("invalid ttl argument {:?}", ttl)))?;

        let now = Instant::now();
        let mut entry = self.data.entry(key.clone()).or_insert_with(|| StoredValue {
            value: String::new(),
            expires_at: Some(now),
        });
        let actual = if entry.is_live(now) {
            Some(entry.value.as_str())
        } else {
            None
        };

        let matches = match actual {
            None => expected.is_empty(),
            Some(actual) => actual == expected,
        };
        let new_version = (if matches { desired } else { on_mismatch }).clone();

        *entry = StoredValue {
            value: new_version.clone(),
            expires_at: (ttl_ms > 0).then(|| now + Duration::from_millis(ttl_ms)),
        };
        Ok(new_version)
    }
}

#[async_trait]
impl KvNode for InMemoryNode {
    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.keys_read.fetch_add(keys.len() as u64, Ordering::Relaxed);
        self.check_fault()?;

        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|key| {
                self.data
                    .get(key)
                    .filter(|v| v.is_live(now))
                    .map(|v| v.value.clone())
            })
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.check_fault()?;

        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.data.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<String> {
        self.eval_shas.fetch_add(1, Ordering::Relaxed);
        self.check_fault()?;

        if !self.loaded_scripts.read().contains(sha) {
            return Err(Error::ScriptNotLoaded(sha.to_string()));
        }
        self.run_cas(keys, args)
    }

    async fn eval(&self, body: &str, keys: &[String], args: &[String]) -> Result<String> {
        self.evals.fetch_add(1, Ordering::Relaxed);
        self.check_fault()?;

        if body != CAS_SCRIPT_BODY {
            return Err(Error::Script(
                "in-memory node only executes the version CAS script".to_string(),
            ));
        }
        self.loaded_scripts
            .write()
            .insert(CAS_SCRIPT.sha().to_string());
        self.run_cas(keys, args)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

// =============================================================================
// Tests
// =============================================================================
