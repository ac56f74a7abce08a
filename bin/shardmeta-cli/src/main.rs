//! shardmeta CLI - Admin Command Line Interface
//!
//! Drives a shard registry over the configured shards and prints results
//! as JSON on stdout.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use futures::TryStreamExt;
use serde_json::json;
use shardmeta_client::{
    DeleteOptions, GetOptions, PutOptions, SearchOptions, ShardRegistry, StoredMetadata,
};
use shardmeta_common::{
    HashAlgorithm, Headers, NewMetadata, ObjectFields, RegistryConfig, Shark,
};
use shardmeta_meta_store::{LocalConnector, Sort, SortOrder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardmeta-cli")]
#[command(about = "Sharded metadata store admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "SHARDMETA_CONFIG")]
    config: Option<String>,

    /// Shard URL (file:///path/shard.redb or mem://name); repeatable,
    /// replaces the configured shard list
    #[arg(long = "shard")]
    shards: Vec<String>,

    /// Skip provisioning and refuse writes
    #[arg(long)]
    read_only: bool,

    /// Ring hash algorithm (sha1, sha256, xxh64)
    #[arg(long)]
    hash: Option<HashAlgorithm>,

    /// Seconds to wait for every shard to become ready
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EntryType {
    Object,
    Directory,
    Link,
    Bucket,
    #[value(name = "bucketobject")]
    BucketObject,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a metadata record
    Put {
        /// Full key of the entry
        key: String,
        /// Owning account
        #[arg(long)]
        owner: String,
        #[arg(long = "type", value_enum, default_value = "object")]
        entry_type: EntryType,
        /// Creating user, defaults to the owner
        #[arg(long)]
        creator: Option<String>,
        /// Identifier of the stored bytes (objects)
        #[arg(long)]
        object_id: Option<String>,
        #[arg(long, default_value = "0")]
        content_length: u64,
        #[arg(long, default_value = "")]
        content_md5: String,
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
        /// Storage node holding a replica; repeatable
        #[arg(long = "shark")]
        sharks: Vec<String>,
        /// Containing directory (bucket objects)
        #[arg(long)]
        dirname: Option<String>,
        /// Key of the object a link points at
        #[arg(long)]
        source: Option<String>,
        /// Header as name=value; repeatable
        #[arg(long = "header")]
        headers: Vec<String>,
        /// Role tag; repeatable
        #[arg(long = "role")]
        roles: Vec<String>,
        /// Only write if the stored etag matches
        #[arg(long)]
        etag: Option<String>,
        /// Queue superseded objects for fast deletion
        #[arg(long)]
        snaplinks_disabled: bool,
    },
    /// Read a metadata record
    Get {
        key: String,
        /// Bucket directory the record was placed by (bucket objects)
        #[arg(long)]
        dirname: Option<String>,
    },
    /// Delete a metadata record
    Del {
        key: String,
        /// Only delete if the stored etag matches
        #[arg(long)]
        etag: Option<String>,
        #[arg(long)]
        snaplinks_disabled: bool,
        /// Bucket directory the record was placed by (bucket objects)
        #[arg(long)]
        dirname: Option<String>,
    },
    /// Show the number of entries in a directory
    Count {
        dir: String,
    },
    /// Search the entries of a directory with an LDAP-style filter
    Find {
        dir: String,
        filter: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Attribute to sort by
        #[arg(long)]
        sort: Option<String>,
        /// Sort descending
        #[arg(long)]
        desc: bool,
    },
    /// Show the hash ring topology
    Ring,
    /// Ping the shard owning a key
    Ping {
        key: String,
    },
}

fn load_config(args: &Args) -> Result<RegistryConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::with_name(path));
    }
    let mut config: RegistryConfig = builder
        .add_source(
            config::Environment::with_prefix("SHARDMETA")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("shards")
                .try_parsing(true),
        )
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if !args.shards.is_empty() {
        config.shards.clone_from(&args.shards);
    }
    if args.read_only {
        config.connection.read_only = true;
    }
    if let Some(algorithm) = args.hash {
        config.hash.algorithm = algorithm;
    }
    Ok(config)
}

fn parse_headers(raw: &[String]) -> Result<Headers> {
    raw.iter()
        .map(|h| {
            h.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("header must be name=value: {h}"))
        })
        .collect()
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn stored_json(stored: &StoredMetadata) -> Result<serde_json::Value> {
    Ok(json!({
        "etag": stored.etag,
        "record": stored.record.to_value()?,
    }))
}

#[allow(clippy::too_many_lines)]
async fn run(registry: &ShardRegistry, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            key,
            owner,
            entry_type,
            creator,
            object_id,
            content_length,
            content_md5,
            content_type,
            sharks,
            dirname,
            source,
            headers,
            roles,
            etag,
            snaplinks_disabled,
        } => {
            let object = || -> Result<ObjectFields> {
                Ok(ObjectFields {
                    content_length,
                    content_md5: content_md5.clone(),
                    content_type: content_type.clone(),
                    object_id: object_id.clone().context("--object-id is required")?,
                    etag: None,
                    sharks: sharks.iter().map(Shark::new).collect(),
                })
            };
            let mut entry = match entry_type {
                EntryType::Object => NewMetadata::object(&key, &owner, object()?),
                EntryType::Directory => NewMetadata::directory(&key, &owner),
                EntryType::Bucket => NewMetadata::bucket(&key, &owner),
                EntryType::BucketObject => {
                    let dirname = dirname.clone().context("--dirname is required")?;
                    NewMetadata::bucket_object(&key, &owner, dirname, object()?)
                }
                EntryType::Link => {
                    let source = source.context("--source is required")?;
                    let target = registry
                        .get_metadata(&source, &GetOptions::default())
                        .await?;
                    NewMetadata::link(&key, &owner, target.record)
                }
            };
            entry = entry
                .with_headers(parse_headers(&headers)?)
                .with_roles(roles);
            if let Some(creator) = creator {
                entry = entry.with_creator(creator);
            }

            let opts = PutOptions {
                expected_etag: etag,
                snaplinks_disabled,
                ..PutOptions::default()
            };
            let stored = registry.put_metadata(entry, &opts).await?;
            print_json(&stored_json(&stored)?)
        }
        Commands::Get { key, dirname } => {
            let opts = GetOptions {
                dirname,
                ..GetOptions::default()
            };
            let stored = registry.get_metadata(&key, &opts).await?;
            print_json(&stored_json(&stored)?)
        }
        Commands::Del {
            key,
            etag,
            snaplinks_disabled,
            dirname,
        } => {
            let opts = DeleteOptions {
                expected_etag: etag,
                snaplinks_disabled,
                dirname,
                ..DeleteOptions::default()
            };
            registry.del_metadata(&key, &opts).await?;
            print_json(&json!({ "deleted": key }))
        }
        Commands::Count { dir } => {
            let entries = registry
                .get_directory_count(&dir, &GetOptions::default())
                .await?;
            print_json(&json!({ "dirname": dir, "entries": entries }))
        }
        Commands::Find {
            dir,
            filter,
            limit,
            offset,
            sort,
            desc,
        } => {
            let opts = SearchOptions {
                limit,
                offset,
                sort: sort.map(|attribute| Sort {
                    attribute,
                    order: if desc { SortOrder::Desc } else { SortOrder::Asc },
                }),
                ..SearchOptions::default()
            };
            let mut results = registry.search(&dir, &filter, &opts)?;
            while let Some(record) = results.try_next().await? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
        Commands::Ring => print_json(&serde_json::to_value(registry.ring())?),
        Commands::Ping { key } => {
            registry.ping(&key).await?;
            let shard = registry.client_for(&key)?;
            print_json(&json!({ "key": key, "shard": shard.url(), "ok": true }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args)?;
    if config.shards.is_empty() {
        bail!("no shards configured; pass --shard or set shards in the config file");
    }
    debug!(?config, "loaded configuration");

    let registry = ShardRegistry::connect(config, Arc::new(LocalConnector::new()))?;
    tokio::time::timeout(Duration::from_secs(args.timeout), registry.wait_ready())
        .await
        .context("timed out waiting for shards")??;
    info!(%registry, "registry ready");

    let result = run(&registry, args.command).await;
    registry.close().await;
    result
}
