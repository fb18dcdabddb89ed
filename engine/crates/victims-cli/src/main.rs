//! Victims CLI - maintain and query the local victims database
//!
//! This is the main entry point for the `victims` binary.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::time::Duration;
use tracing::info;
use victims_common::{init_logging, Config};
use victims_core::FingerprintLookup;
use victims_db::{VictimsDb, VictimsSync};

/// Victims database tool
#[derive(Parser, Debug)]
#[command(name = "victims")]
#[command(version)]
#[command(about = "Synchronize and query the local victims fingerprint database", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "victims.toml")]
    config: String,

    /// Database path (overrides config)
    #[arg(long)]
    database: Option<String>,

    /// Service URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json, compact)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull additions and removals from the remote service
    Sync,
    /// Print every stored advisory
    List,
    /// Print one advisory by id
    Get { id: i64 },
    /// Delete one advisory by id
    Remove { id: i64 },
    /// Print the newest created timestamp in the database
    Latest,
    /// Exact lookup by digest, coordinates or metadata
    Lookup {
        /// Digest of a single file inside an artifact
        #[arg(long, group = "key")]
        file_hash: Option<String>,

        /// Digest of a whole artifact
        #[arg(long, group = "key")]
        artifact_hash: Option<String>,

        /// vendor, name and version
        #[arg(long, group = "key", num_args = 3, value_names = ["VENDOR", "NAME", "VERSION"])]
        coordinates: Option<Vec<String>>,

        /// pom.properties groupId, artifactId and version
        #[arg(long, group = "key", num_args = 3, value_names = ["GROUP", "ARTIFACT", "VERSION"])]
        pom: Option<Vec<String>>,

        /// Manifest Implementation-Vendor, -Title and -Version
        #[arg(long, group = "key", num_args = 3, value_names = ["VENDOR", "TITLE", "VERSION"])]
        implementation: Option<Vec<String>>,
    },
    /// Tolerance-based lookup by a set of file digests
    Match {
        /// Fraction of digests that must hit (defaults to the configured tolerance)
        #[arg(long)]
        tolerance: Option<f64>,

        /// Candidate file digests
        #[arg(required = true)]
        digests: Vec<String>,
    },
    /// Manage the database schema
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },
}

#[derive(Subcommand, Debug)]
enum SchemaAction {
    /// Create any missing tables
    Create,
    /// Drop all tables
    Drop,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        Config::default()
    };
    let mut config = config.merge_env()?;

    if let Some(path) = args.database {
        config.database.path = path;
    }
    if let Some(url) = args.url {
        config.service.url = url;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    // Initialize logging
    init_logging(&config.logging);

    config.validate()?;
    info!("Using database {}", config.database.path);

    let db = VictimsDb::new(&config.database.path);
    if !matches!(args.command, Command::Schema { .. }) {
        db.ensure_schema()?;
    }

    match args.command {
        Command::Sync => {
            if !config.rule.updates_enabled() {
                info!("Updates are disabled, skipping synchronization");
                return Ok(());
            }

            let sync = VictimsSync::with_timeout(
                config.service.url.clone(),
                Duration::from_secs(config.service.request_timeout_seconds.into()),
            )?
            .with_duplicate_policy(config.sync.duplicates);

            let stats = sync
                .synchronize(&db)
                .await
                .context("synchronization failed")?;
            info!(
                "Sync complete: {} added, {} replaced, {} removed, {} skipped",
                stats.added, stats.replaced, stats.removed, stats.skipped
            );
        }
        Command::List => print_json(&db.list()?)?,
        Command::Get { id } => match db.get(id)? {
            Some(record) => print_json(&record)?,
            None => bail!("no advisory with id {}", id),
        },
        Command::Remove { id } => {
            if db.remove(id)? {
                info!("Removed advisory {}", id);
            } else {
                info!("No advisory with id {}", id);
            }
        }
        Command::Latest => match db.latest_watermark()? {
            Some(latest) => println!("{}", victims_core::format_timestamp(&latest)),
            None => println!("empty"),
        },
        Command::Lookup {
            file_hash,
            artifact_hash,
            coordinates,
            pom,
            implementation,
        } => {
            let found = if let Some(digest) = file_hash {
                db.find_by_file_hash(&digest)?
            } else if let Some(digest) = artifact_hash {
                db.find_by_artifact_hash(&digest)?
            } else if let Some([vendor, name, version]) = coordinates.as_deref() {
                db.find_by_coordinates(vendor, name, version)?
            } else if let Some([group, artifact, version]) = pom.as_deref() {
                db.find_by_pom_properties(group, artifact, version)?
            } else if let Some([vendor, title, version]) = implementation.as_deref() {
                db.find_by_implementation(vendor, title, version)?
            } else {
                bail!("one of --file-hash, --artifact-hash, --coordinates, --pom or --implementation is required");
            };
            print_json(&found)?;
        }
        Command::Match { tolerance, digests } => {
            let tolerance = tolerance.unwrap_or(config.rule.tolerance);
            print_json(&db.find_by_partial_hash_set(&digests, tolerance)?)?;
        }
        Command::Schema { action } => match action {
            SchemaAction::Create => {
                db.ensure_schema()?;
                info!("Schema ready");
            }
            SchemaAction::Drop => {
                db.drop_schema()?;
                info!("Schema dropped");
            }
        },
    }

    Ok(())
}
