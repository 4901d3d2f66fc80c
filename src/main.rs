//! verscache operator CLI
//!
//! Inspect and advance dependency versions on a running cache cluster.
//!
//! ```text
//! verscache --node redis://a:6379 --node 'redis://b:6379|redis://b2:6379' \
//!     invalidate --type user --prop id=42
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use verscache::error::{Error, Result};
use verscache::{Engine, EngineConfig, KvNode, Memoizable, RedisNode, Shard, ShardedStore};

// =============================================================================
// CLI Arguments
// =============================================================================

/// verscache - version-addressable cache administration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Shard as `primary[|replica...]` redis URLs; repeat per shard
    #[arg(long = "node", env = "VERSCACHE_NODES", value_delimiter = ',', required = true)]
    nodes: Vec<String>,

    /// Key namespace (overrides the config file)
    #[arg(long, env = "VERSCACHE_NAMESPACE")]
    namespace: Option<String>,

    /// YAML engine config
    #[arg(long, env = "VERSCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current version of each dependency key
    Versions {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Invalidate one dependency node
    Invalidate {
        /// Node type name
        #[arg(long = "type")]
        type_name: String,

        /// Node prop as `name=value`; values parse as JSON, else string
        #[arg(long = "prop", value_parser = parse_prop)]
        props: Vec<(String, Value)>,
    },
}

fn parse_prop(raw: &str) -> std::result::Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {:?}", raw))?;
    if name.is_empty() {
        return Err(format!("empty prop name in {:?}", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => {
            let doc = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            EngineConfig::from_yaml(&doc)?
        }
        None => EngineConfig::default(),
    };
    if let Some(namespace) = &args.namespace {
        config = config.with_namespace(namespace.clone());
    }
    // Operator commands must see failures, not fail open
    config = config.with_raise_on_error(true);

    let store = connect(&args.nodes).await?;
    let engine = Engine::builder(store).config(config).build()?;

    match args.command {
        Command::Versions { keys } => {
            let versions = engine.versions().get_versions(&keys).await?;
            for key in &keys {
                let version = versions.get(key).map(String::as_str).unwrap_or("<none>");
                println!("{}\t{}", key, version);
            }
        }
        Command::Invalidate { type_name, props } => {
            let node = Memoizable::new(type_name, props);
            let scope = engine.scope();
            engine.invalidate(&scope, std::slice::from_ref(&node)).await?;
            engine.shutdown().await;
            if !engine.queue().is_empty() {
                return Err(Error::Connection(format!(
                    "invalidation of {} still pending",
                    node.cache_key()
                )));
            }
            info!(key = %node.cache_key(), "invalidated");
            println!("{}", node.cache_key());
        }
    }

    Ok(())
}

/// Connect every shard: `primary|replica|replica`.
async fn connect(specs: &[String]) -> Result<ShardedStore> {
    let mut shards = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut urls = spec.split('|').map(str::trim).filter(|u| !u.is_empty());
        let primary = urls
            .next()
            .ok_or_else(|| Error::Config(format!("empty shard spec {:?}", spec)))?;

        let primary: Arc<dyn KvNode> = Arc::new(RedisNode::connect(primary).await?);
        let mut replicas: Vec<Arc<dyn KvNode>> = Vec::new();
        for url in urls {
            replicas.push(Arc::new(RedisNode::connect(url).await?));
        }
        info!(primary = %primary.address(), replicas = replicas.len(), "shard connected");
        shards.push(Shard::new(primary).with_replicas(replicas));
    }
    ShardedStore::new(shards)
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr; stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
