//! Redis node
//!
//! [`KvNode`] over a multiplexed async Redis connection. Connection and
//! timeout failures are mapped to the transient error class, `NOSCRIPT` to
//! [`Error::ScriptNotLoaded`], and anything else to [`Error::Script`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, RedisError};
use tracing::{debug, instrument};

use super::KvNode;
use crate::error::{Error, Result};

/// A single Redis server
pub struct RedisNode {
    address: String,
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisNode")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl RedisNode {
    /// Connect to a node given a `redis://` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| Error::Config(format!("{}: {}", url, e)))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;

        debug!(address = %url, "connected to redis node");

        Ok(Self {
            address: url.to_string(),
            connection,
        })
    }
}

fn map_redis_error(err: RedisError) -> Error {
    if err.kind() == ErrorKind::NoScriptError {
        Error::ScriptNotLoaded(err.to_string())
    } else if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_unrecoverable_error()
    {
        Error::Connection(err.to_string())
    } else {
        Error::Script(err.to_string())
    }
}

#[async_trait]
impl KvNode for RedisNode {
    #[instrument(skip(self, keys), fields(node = %self.address, count = keys.len()))]
    async fn get_multi(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    #[instrument(skip(self, value), fields(node = %self.address))]
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(())
    }

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> Result<String> {
        let mut conn = self.connection.clone();
        redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn eval(&self, body: &str, keys: &[String], args: &[String]) -> Result<String> {
        let mut conn = self.connection.clone();
        redis::cmd("EVAL")
            .arg(body)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    fn address(&self) -> &str {
        &self.address
    }
}
