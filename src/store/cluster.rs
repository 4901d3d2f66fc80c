//! Sharded Store
//!
//! Horizontal sharding across independent nodes by consistent hashing, with
//! optional read replicas per shard.
//!
//! # Design
//!
//! - Each shard owns 160 virtual points on a 64-bit ring
//! - A key belongs to the first point at or after its own hash
//! - Plain reads go to a random replica when replicas exist
//! - Scripts and writes always go to the primary
//! - Script hashes are tried first; the body is sent once per node on
//!   "not loaded" and the node is remembered as loaded

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::future::try_join_all;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use super::script::Script;
use super::KvNode;
use crate::error::{Error, Result};

/// Virtual points per shard
const POINTS_PER_SHARD: usize = 160;

fn ring_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Consistent hash ring mapping keys to shard indices
#[derive(Debug, Clone)]
pub struct HashRing {
    points: Vec<(u64, usize)>,
    shard_count: usize,
}

impl HashRing {
    /// Build a ring for shards identified by the given names.
    pub fn new<S: AsRef<str>>(shard_names: &[S]) -> Self {
        let mut points: Vec<(u64, usize)> = shard_names
            .iter()
            .enumerate()
            .flat_map(|(idx, name)| {
                (0..POINTS_PER_SHARD)
                    .map(move |i| (ring_hash(&format!("{}-{}", name.as_ref(), i)), idx))
            })
            .collect();
        points.sort_unstable();

        Self {
            points,
            shard_count: shard_names.len(),
        }
    }

    /// Shard index owning `key`
    pub fn shard_for(&self, key: &str) -> usize {
        if self.shard_count <= 1 {
            return 0;
        }
        let hash = ring_hash(key);
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        let (_, shard) = self.points[idx % self.points.len()];
        shard
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }
}

/// One shard: a primary and zero or more read replicas
#[derive(Clone)]
pub struct Shard {
    primary: Arc<dyn KvNode>,
    replicas: Vec<Arc<dyn KvNode>>,
}

impl Shard {
    pub fn new(primary: Arc<dyn KvNode>) -> Self {
        Self {
            primary,
            replicas: Vec::new(),
        }
    }

    pub fn with_replicas(mut self, replicas: Vec<Arc<dyn KvNode>>) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn primary(&self) -> &Arc<dyn KvNode> {
        &self.primary
    }

    fn reader(&self, use_replicas: bool) -> &Arc<dyn KvNode> {
        if use_replicas {
            if let Some(replica) = self.replicas.choose(&mut rand::thread_rng()) {
                return replica;
            }
        }
        &self.primary
    }
}

/// Backing store spread over one or more shards
pub struct ShardedStore {
    shards: Vec<Shard>,
    ring: HashRing,
    replica_reads: bool,
    /// (node address, script sha) pairs known to be loaded
    loaded_scripts: DashSet<(String, String)>,
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("shards", &self.shards.len())
            .field("replica_reads", &self.replica_reads)
            .finish_non_exhaustive()
    }
}

impl ShardedStore {
    /// Create a store over the given shards. At least one shard is required.
    pub fn new(shards: Vec<Shard>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::Config("at least one shard is required".to_string()));
        }
        let names: Vec<String> = shards
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}#{}", s.primary.address(), i))
            .collect();

        Ok(Self {
            ring: HashRing::new(&names),
            shards,
            replica_reads: true,
            loaded_scripts: DashSet::new(),
        })
    }

    /// Single-node store
    pub fn single(node: Arc<dyn KvNode>) -> Self {
        Self {
            ring: HashRing::new(&[node.address().to_string()]),
            shards: vec![Shard::new(node)],
            replica_reads: true,
            loaded_scripts: DashSet::new(),
        }
    }

    /// Toggle replica load-balancing for plain reads.
    pub fn with_replica_reads(mut self, enabled: bool) -> Self {
        self.replica_reads = enabled;
        self
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &str) -> &Shard {
        &self.shards[self.ring.shard_for(key)]
    }

    /// Read one key.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let keys = [key.to_string()];
        let mut values = self
            .shard_for(key)
            .reader(self.replica_reads)
            .get_multi(&keys)
            .await?;
        Ok(values.pop().flatten())
    }

    /// Read many keys: one round trip per shard involved, issued
    /// concurrently, results in input order.
    #[instrument(skip_all, fields(count = keys.len()))]
    pub async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_shard: BTreeMap<usize, (Vec<usize>, Vec<String>)> = BTreeMap::new();
        for (pos, key) in keys.iter().enumerate() {
            let (positions, shard_keys) = by_shard.entry(self.ring.shard_for(key)).or_default();
            positions.push(pos);
            shard_keys.push(key.clone());
        }

        let replica_reads = self.replica_reads;
        let reads = by_shard.into_iter().map(|(shard, (positions, shard_keys))| {
            let node = self.shards[shard].reader(replica_reads).clone();
            async move {
                let values = node.get_multi(&shard_keys).await?;
                Ok::<_, Error>((positions, values))
            }
        });

        let mut out = vec![None; keys.len()];
        for (positions, values) in try_join_all(reads).await? {
            for (pos, value) in positions.into_iter().zip(values) {
                out[pos] = value;
            }
        }
        Ok(out)
    }

    /// Write one key on its shard's primary.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.shard_for(key).primary.set(key, value, ttl).await
    }

    /// Run a script against the primary of the shard owning `keys[0]`.
    ///
    /// Tries the hash first and falls back to the full body when the node
    /// reports the script as not loaded.
    #[instrument(skip_all, fields(sha = %script.sha()))]
    pub async fn run_script(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<String> {
        let routing_key = keys
            .first()
            .ok_or_else(|| Error::Script("script needs at least one key for routing".into()))?;
        let node = self.shard_for(routing_key).primary.clone();

        match node.eval_sha(script.sha(), keys, args).await {
            Err(Error::ScriptNotLoaded(_)) => {
                debug!(node = %node.address(), "script not loaded, sending body");
                let result = node.eval(script.body(), keys, args).await?;
                self.loaded_scripts
                    .insert((node.address().to_string(), script.sha().to_string()));
                Ok(result)
            }
            Ok(result) => {
                self.loaded_scripts
                    .insert((node.address().to_string(), script.sha().to_string()));
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `script` is known to be loaded on `node_address`.
    pub fn is_script_loaded(&self, node_address: &str, script: &Script) -> bool {
        self.loaded_scripts
            .contains(&(node_address.to_string(), script.sha().to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
