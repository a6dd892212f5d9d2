//! Shardstore CLI
//!
//! Client tool for buckets and objects. `login` pins the endpoint (and
//! optional bearer token) into a local config file; object commands run
//! the full encrypt/encode/place pipeline from this machine.
//!
//! Exit codes: 0 success, 1 local error, 2 server error, 3 auth failure.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use shardstore_api::{ListObjectsParams, MigrationState};
use shardstore_client::{MetaClient, Pipeline};
use shardstore_common::{Error, ErasureParams, Tier};
use shardstore_crypto::LocalSecretProvider;
use shardstore_erasure::ShardCodec;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardstore")]
#[command(about = "Shardstore client CLI")]
#[command(version)]
struct Args {
    /// Config file (default: ~/.config/shardstore/cli.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store the endpoint (and token) for later commands
    Login {
        /// Metadata service endpoint, e.g. http://meta:7400
        endpoint: String,
        /// Bearer token issued by the auth provider
        #[arg(long)]
        token: Option<String>,
        /// Erasure coding data shards of the deployment
        #[arg(long, default_value = "6")]
        ec_k: u8,
        /// Erasure coding parity shards of the deployment
        #[arg(long, default_value = "3")]
        ec_m: u8,
    },
    /// Bucket operations
    Bucket {
        #[command(subcommand)]
        action: BucketCommands,
    },
    /// Object operations
    Object {
        #[command(subcommand)]
        action: ObjectCommands,
    },
    /// Show cluster status
    Cluster,
}

#[derive(Subcommand, Debug)]
enum BucketCommands {
    /// Create a bucket
    Create {
        name: String,
        /// Owner recorded on the bucket
        #[arg(long, default_value = "cli")]
        owner: String,
    },
    /// Delete a bucket and everything in it
    Delete { name: String },
    /// List buckets
    List,
}

#[derive(Subcommand, Debug)]
enum ObjectCommands {
    /// Upload a file
    Upload {
        bucket: String,
        key: String,
        /// Path of the file to upload
        file: PathBuf,
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
        /// Initial tier
        #[arg(long, default_value = "hot")]
        tier: Tier,
    },
    /// Download an object
    Download {
        bucket: String,
        key: String,
        /// Output path (defaults to the last key segment)
        output: Option<PathBuf>,
    },
    /// Delete an object
    Delete { bucket: String, key: String },
    /// List objects in a bucket
    List {
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Move an object to another tier and wait for completion
    MigrateTier {
        bucket: String,
        key: String,
        /// Target tier (hot|cold)
        tier: Tier,
        /// Seconds between status polls
        #[arg(long, default_value = "2")]
        poll_secs: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct CliConfig {
    endpoint: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default = "default_k")]
    ec_k: u8,
    #[serde(default = "default_m")]
    ec_m: u8,
}

fn default_k() -> u8 {
    6
}

fn default_m() -> u8 {
    3
}

fn config_path(args: &Args) -> Result<PathBuf, Error> {
    if let Some(path) = &args.config {
        return Ok(path.clone());
    }
    let home = std::env::var("HOME")
        .map_err(|_| Error::invalid_request("HOME not set; pass --config"))?;
    Ok(Path::new(&home).join(".config/shardstore/cli.toml"))
}

fn load_config(path: &Path) -> Result<CliConfig, Error> {
    let raw = std::fs::read_to_string(path).map_err(|_| {
        Error::invalid_request(format!(
            "no config at {}; run `shardstore login <endpoint>` first",
            path.display()
        ))
    })?;
    toml::from_str(&raw).map_err(|e| Error::Serialization(format!("bad config file: {e}")))
}

fn meta_client(config: &CliConfig) -> Result<MetaClient, Error> {
    let client = MetaClient::new(&config.endpoint)?;
    Ok(match &config.token {
        Some(token) => client.with_token(token),
        None => client,
    })
}

fn pipeline(config: &CliConfig, config_file: &Path) -> Result<Pipeline, Error> {
    let codec = ShardCodec::new(ErasureParams::new(config.ec_k, config.ec_m))
        .map_err(|e| Error::invalid_request(format!("erasure params: {e}")))?;
    let keys_dir = config_file
        .parent()
        .map(|dir| dir.join("keys"))
        .unwrap_or_else(|| PathBuf::from("keys"));
    let secrets = Arc::new(LocalSecretProvider::open(keys_dir)?);
    Pipeline::new(meta_client(config)?, Arc::new(codec), secrets)
}

fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Map the error taxonomy onto process exit codes
fn exit_code(e: &Error) -> i32 {
    match e {
        Error::AuthFailure(_) => 3,
        Error::InvalidRequest(_)
        | Error::InvalidBucketName(_)
        | Error::InvalidObjectKey(_)
        | Error::InvalidTier(_)
        | Error::IoFailure(_) => 1,
        _ => 2,
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let config_file = config_path(&args)?;

    match args.command {
        Commands::Login {
            endpoint,
            token,
            ec_k,
            ec_m,
        } => {
            // Probe the endpoint before persisting it.
            let client = MetaClient::new(&endpoint)?;
            let status = client.cluster_status().await?;

            let config = CliConfig {
                endpoint: endpoint.clone(),
                token,
                ec_k,
                ec_m,
            };
            if let Some(dir) = config_file.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let raw = toml::to_string_pretty(&config)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            std::fs::write(&config_file, raw)?;

            println!("Logged in to {endpoint}");
            println!("Cluster state: {}", status.state);
            println!("Config saved to {}", config_file.display());
        }

        Commands::Bucket { action } => {
            let config = load_config(&config_file)?;
            let client = meta_client(&config)?;
            match action {
                BucketCommands::Create { name, owner } => {
                    let bucket = client
                        .create_bucket(&shardstore_api::CreateBucketRequest {
                            name: name.clone(),
                            owner,
                            acl: BTreeMap::new(),
                            metadata: BTreeMap::new(),
                        })
                        .await?;
                    println!("Bucket '{}' created (owner: {})", bucket.name, bucket.owner);
                }
                BucketCommands::Delete { name } => {
                    client.delete_bucket(&name).await?;
                    println!("Bucket '{name}' deleted");
                }
                BucketCommands::List => {
                    let buckets = client.list_buckets().await?;
                    if buckets.is_empty() {
                        println!("No buckets");
                    } else {
                        println!("{:<30} {:<15} {:>10} {:>12}", "NAME", "OWNER", "OBJECTS", "SIZE");
                        println!("{}", "-".repeat(70));
                        for bucket in buckets {
                            println!(
                                "{:<30} {:<15} {:>10} {:>12}",
                                bucket.name,
                                bucket.owner,
                                bucket.object_count,
                                format_size(bucket.total_size)
                            );
                        }
                    }
                }
            }
        }

        Commands::Object { action } => {
            let config = load_config(&config_file)?;
            match action {
                ObjectCommands::Upload {
                    bucket,
                    key,
                    file,
                    content_type,
                    tier,
                } => {
                    let data = std::fs::read(&file)?;
                    let pipeline = pipeline(&config, &config_file)?;
                    let object = pipeline
                        .upload(&bucket, &key, &data, &content_type, tier, BTreeMap::new())
                        .await?;
                    println!(
                        "Uploaded {}/{} ({}, {} shards, tier {})",
                        bucket,
                        key,
                        format_size(object.size),
                        object.shards.len(),
                        object.tier
                    );
                }
                ObjectCommands::Download {
                    bucket,
                    key,
                    output,
                } => {
                    let pipeline = pipeline(&config, &config_file)?;
                    let data = pipeline.download(&bucket, &key).await?;
                    let output = output.unwrap_or_else(|| {
                        PathBuf::from(key.rsplit('/').next().unwrap_or(&key))
                    });
                    std::fs::write(&output, &data)?;
                    println!(
                        "Downloaded {}/{} to {} ({})",
                        bucket,
                        key,
                        output.display(),
                        format_size(data.len() as u64)
                    );
                }
                ObjectCommands::Delete { bucket, key } => {
                    let pipeline = pipeline(&config, &config_file)?;
                    pipeline.delete(&bucket, &key).await?;
                    println!("Deleted {bucket}/{key}");
                }
                ObjectCommands::List { bucket, prefix } => {
                    let client = meta_client(&config)?;
                    let page = client
                        .list_objects(
                            &bucket,
                            &ListObjectsParams {
                                prefix: if prefix.is_empty() { None } else { Some(prefix) },
                                start_after: None,
                                max_keys: None,
                            },
                        )
                        .await?;
                    if page.objects.is_empty() {
                        println!("No objects in '{bucket}'");
                    } else {
                        println!("{:<50} {:>12} {:<6} {:<20}", "KEY", "SIZE", "TIER", "CONTENT-TYPE");
                        println!("{}", "-".repeat(92));
                        for object in &page.objects {
                            println!(
                                "{:<50} {:>12} {:<6} {:<20}",
                                object.key,
                                format_size(object.size),
                                object.tier,
                                object.content_type
                            );
                        }
                        if page.is_truncated {
                            println!("... truncated");
                        }
                    }
                }
                ObjectCommands::MigrateTier {
                    bucket,
                    key,
                    tier,
                    poll_secs,
                } => {
                    let client = meta_client(&config)?;
                    let migration_id = client.submit_migration(&bucket, &key, tier).await?;
                    println!("Migration {migration_id} submitted, waiting...");

                    loop {
                        tokio::time::sleep(Duration::from_secs(poll_secs)).await;
                        let status = client.migration_status(&migration_id).await?;
                        match status.state {
                            MigrationState::Running => continue,
                            MigrationState::Succeeded => {
                                println!("Object {bucket}/{key} is now {tier}");
                                break;
                            }
                            MigrationState::Failed => {
                                return Err(Error::internal(format!(
                                    "migration failed: {}",
                                    status.error.unwrap_or_else(|| "unknown".into())
                                )));
                            }
                        }
                    }
                }
            }
        }

        Commands::Cluster => {
            let config = load_config(&config_file)?;
            let client = meta_client(&config)?;
            let status = client.cluster_status().await?;
            println!("Cluster Status");
            println!("==============");
            println!("State:         {}", status.state);
            println!(
                "Leader:        {}",
                status.leader.as_deref().unwrap_or("(none)")
            );
            println!(
                "Last index:    {}",
                status.last_index.map_or("-".into(), |i| i.to_string())
            );
            println!(
                "Applied index: {}",
                status.applied_index.map_or("-".into(), |i| i.to_string())
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(args).await {
        eprintln!("error: {e}");
        std::process::exit(exit_code(&e));
    }
}
