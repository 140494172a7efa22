//! offsync CLI - Command line interface for offline-first data stores.
//!
//! Reads and writes records of one collection through a [`DataStore`],
//! using the store and backend named in the config file. Records are
//! exchanged as JSON on stdin and stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use offsync_common::{Query, Record};
use offsync_gateway::HttpGatewayConfig;
use offsync_sync::{DataStore, EngineConfig, ReadPolicy, RemoveTarget, SyncEngine, WritePolicy};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "offsync - Offline-first record sync")]
#[command(version)]
struct Cli {
    /// Config file (default: offsync/config.json in the user config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file for a backend.
    Init {
        /// Backend base URL.
        #[arg(short, long)]
        base_url: String,

        /// Bearer token for the backend.
        #[arg(short, long)]
        token: Option<String>,

        /// SQLite database path (default: in the user data dir).
        #[arg(short, long)]
        database: Option<PathBuf>,
    },

    /// Print one record.
    Get {
        /// Collection name.
        collection: String,

        /// Record id.
        id: String,

        #[arg(short, long, value_enum, default_value = "both")]
        policy: ReadArg,
    },

    /// Print the records a query matches.
    Find {
        /// Collection name.
        collection: String,

        /// Query as JSON, e.g. '{"filter":{"genre":"sf"},"limit":10}'.
        #[arg(short, long)]
        query: Option<String>,

        #[arg(short, long, value_enum, default_value = "both")]
        policy: ReadArg,
    },

    /// Print the number of records a query matches.
    Count {
        /// Collection name.
        collection: String,

        /// Query as JSON.
        #[arg(short, long)]
        query: Option<String>,

        #[arg(short, long, value_enum, default_value = "network")]
        policy: ReadArg,
    },

    /// Save the record read from stdin.
    Save {
        /// Collection name.
        collection: String,

        #[arg(short, long, value_enum, default_value = "local-then-network")]
        policy: WriteArg,
    },

    /// Remove a record, or every record a query matches.
    Remove {
        /// Collection name.
        collection: String,

        /// Record id.
        #[arg(short, long, conflicts_with = "query", required_unless_present = "query")]
        id: Option<String>,

        /// Query as JSON.
        #[arg(short, long)]
        query: Option<String>,

        #[arg(short, long, value_enum, default_value = "local-then-network")]
        policy: WriteArg,
    },

    /// Replay queued writes.
    Push {
        /// Collection name.
        collection: String,
    },

    /// Replace the cached records of a query with the backend's.
    Pull {
        /// Collection name.
        collection: String,

        /// Query as JSON.
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Drop every queued write.
    Purge {
        /// Collection name.
        collection: String,
    },

    /// Forget cached records and queued writes without refetching.
    ClearCache {
        /// Collection name (default: every collection in the config).
        collection: Option<String>,
    },

    /// List queued writes.
    Pending {
        /// Collection name.
        collection: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReadArg {
    Network,
    Local,
    Both,
}

impl From<ReadArg> for ReadPolicy {
    fn from(arg: ReadArg) -> Self {
        match arg {
            ReadArg::Network => ReadPolicy::NetworkOnly,
            ReadArg::Local => ReadPolicy::LocalOnly,
            ReadArg::Both => ReadPolicy::Both,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum WriteArg {
    Network,
    Local,
    LocalThenNetwork,
}

impl From<WriteArg> for WritePolicy {
    fn from(arg: WriteArg) -> Self {
        match arg {
            WriteArg::Network => WritePolicy::ForceNetwork,
            WriteArg::Local => WritePolicy::ForceLocal,
            WriteArg::LocalThenNetwork => WritePolicy::LocalThenNetwork,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Init {
            base_url,
            token,
            database,
        } => cmd_init(&config_path, base_url, token, database),
        command => {
            let engine = open_engine(&config_path)?;
            run(&engine, command).await
        }
    }
}

async fn run(engine: &SyncEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Init { .. } => anyhow::bail!("init does not open the engine"),

        Commands::Get {
            collection,
            id,
            policy,
        } => cmd_get(&store(engine, &collection).await?, &id, policy.into()).await,

        Commands::Find {
            collection,
            query,
            policy,
        } => {
            let query = parse_query(query.as_deref())?;
            cmd_find(&store(engine, &collection).await?, query, policy.into()).await
        }

        Commands::Count {
            collection,
            query,
            policy,
        } => {
            let query = parse_query(query.as_deref())?;
            cmd_count(&store(engine, &collection).await?, query, policy.into()).await
        }

        Commands::Save { collection, policy } => {
            cmd_save(&store(engine, &collection).await?, policy.into()).await
        }

        Commands::Remove {
            collection,
            id,
            query,
            policy,
        } => {
            let target = match id {
                Some(id) => RemoveTarget::Id(id),
                None => RemoveTarget::Query(parse_query(query.as_deref())?),
            };
            cmd_remove(&store(engine, &collection).await?, target, policy.into()).await
        }

        Commands::Push { collection } => cmd_push(&store(engine, &collection).await?).await,

        Commands::Pull { collection, query } => {
            let query = parse_query(query.as_deref())?;
            cmd_pull(&store(engine, &collection).await?, query).await
        }

        Commands::Purge { collection } => cmd_purge(&store(engine, &collection).await?).await,

        Commands::ClearCache { collection } => {
            cmd_clear_cache(engine, collection.as_deref()).await
        }

        Commands::Pending { collection } => {
            cmd_pending(&store(engine, &collection).await?).await
        }
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("offsync").join("config.json"))
}

fn open_engine(path: &Path) -> Result<SyncEngine> {
    let config = EngineConfig::load(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    SyncEngine::from_config(&config).context("Failed to start engine")
}

async fn store(engine: &SyncEngine, collection: &str) -> Result<DataStore> {
    engine
        .data_store(collection)
        .await
        .with_context(|| format!("Failed to open collection {}", collection))
}

fn parse_query(json: Option<&str>) -> Result<Query> {
    match json {
        Some(json) => serde_json::from_str(json).context("Invalid query"),
        None => Ok(Query::all()),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Write a config file using a SQLite store.
fn cmd_init(
    path: &Path,
    base_url: String,
    token: Option<String>,
    database: Option<PathBuf>,
) -> Result<()> {
    let mut gateway = HttpGatewayConfig::new(base_url);
    if let Some(token) = token {
        gateway = gateway.with_auth_token(token);
    }
    let store = match database {
        Some(database) => json!({ "kind": "sqlite", "path": database }),
        None => json!({ "kind": "sqlite" }),
    };
    let config = EngineConfig {
        store,
        gateway: Some(gateway),
        ..EngineConfig::default()
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    config.save(path).context("Failed to write config")?;
    println!("Config written to {}", path.display());
    Ok(())
}

async fn cmd_get(store: &DataStore, id: &str, policy: ReadPolicy) -> Result<()> {
    let record = store
        .get_required(id, policy)
        .value()
        .await
        .with_context(|| format!("Failed to get {}", id))?;
    match record {
        Some(record) => print_json(&record),
        None => anyhow::bail!("Record {} not found", id),
    }
}

async fn cmd_find(store: &DataStore, query: Query, policy: ReadPolicy) -> Result<()> {
    let records = store
        .find(query, policy)
        .value()
        .await
        .context("Failed to find records")?;
    print_json(&records)
}

async fn cmd_count(store: &DataStore, query: Query, policy: ReadPolicy) -> Result<()> {
    let count = store
        .count(query, policy)
        .value()
        .await
        .context("Failed to count records")?;
    println!("{}", count);
    Ok(())
}

/// Save the record read from stdin.
async fn cmd_save(store: &DataStore, policy: WritePolicy) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read stdin")?;
    let record: Record = serde_json::from_str(&input).context("Invalid record")?;

    let saved = store
        .save(record, policy)
        .value()
        .await
        .context("Failed to save record")?;
    if saved.is_local_only() {
        info!("Saved locally; the write is queued");
    }
    print_json(&saved)
}

async fn cmd_remove(store: &DataStore, target: RemoveTarget, policy: WritePolicy) -> Result<()> {
    let removed = store
        .remove(target, policy)
        .value()
        .await
        .context("Failed to remove")?;
    println!("Removed {} records", removed);
    Ok(())
}

async fn cmd_push(store: &DataStore) -> Result<()> {
    let outcome = store.push().value().await.context("Push failed")?;
    print_json(&json!({
        "pushed": outcome.pushed,
        "dropped": outcome.dropped,
        "conflicts": outcome.conflicts,
    }))
}

async fn cmd_pull(store: &DataStore, query: Query) -> Result<()> {
    let records = store.pull(query).value().await.context("Pull failed")?;
    info!("Pulled {} records", records.len());
    print_json(&records)
}

async fn cmd_purge(store: &DataStore) -> Result<()> {
    let purged = store.purge().value().await.context("Purge failed")?;
    println!("Purged {} pending operations", purged);
    Ok(())
}

async fn cmd_clear_cache(engine: &SyncEngine, collection: Option<&str>) -> Result<()> {
    let dropped = match collection {
        Some(collection) => store(engine, collection)
            .await?
            .clear_cache()
            .value()
            .await
            .context("Failed to clear cache")?,
        None => engine.clear_cache().await.context("Failed to clear cache")?,
    };
    println!("Cache cleared, {} pending operations dropped", dropped);
    Ok(())
}

async fn cmd_pending(store: &DataStore) -> Result<()> {
    let pending = store
        .pending()
        .await
        .context("Failed to read pending operations")?;
    if pending.is_empty() {
        println!("No pending operations.");
        return Ok(());
    }
    for op in pending {
        println!(
            "  {:>6}  {:<6} {}  ({})",
            op.sequence,
            format!("{:?}", op.change),
            op.object_id.as_deref().unwrap_or("<query>"),
            op.enqueued_at
        );
    }
    Ok(())
}
