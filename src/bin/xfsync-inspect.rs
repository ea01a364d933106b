/**
 * xfsync-inspect
 *
 * Inspects and repairs a device's local sync database: queue contents,
 * parked operations, manual retries and tombstone housekeeping.
 */
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;
use xfsync::local_db::LocalDatabase;
use xfsync::offline::OfflineManager;
use xfsync::shared::{SyncConfig, SystemClock};
use xfsync::store::LocalStore;

#[derive(Parser, Debug)]
#[command(name = "xfsync-inspect")]
#[command(about = "Inspect the local xfsync database", long_about = None)]
struct Args {
    /// TOML configuration file (defaults to environment overrides)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path, overriding the configuration
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store counters and pull watermark
    Status,
    /// Queued operations in push order
    Pending,
    /// Parked operations awaiting a manual retry
    Failed,
    /// Re-queue the parked operations of one entity
    Retry {
        /// Client identifier of the entity
        entity_id: Uuid,
    },
    /// Remove acknowledged tombstones past the retention window
    PurgeTombstones {
        /// Retention in days, overriding the configuration
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::from_env()?,
    };
    if let Some(path) = args.database {
        config.database_path = path;
    }

    tracing::debug!("Opening {}", config.database_path.display());
    let db = Arc::new(LocalDatabase::open(&config.database_path).await?);

    match args.command {
        Command::Status => {
            let stats = db.stats().await?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "database": config.database_path,
                        "entities": stats.entities,
                        "pending_operations": stats.pending_operations,
                        "failed_operations": stats.failed_operations,
                        "tombstones": stats.tombstones,
                        "unacknowledged_tombstones": stats.unacknowledged_tombstones,
                        "watermark": stats.watermark,
                    }))?
                );
            } else {
                println!("Database:        {}", config.database_path.display());
                println!("Entities:        {}", stats.entities);
                println!("Pending ops:     {}", stats.pending_operations);
                println!("Failed ops:      {}", stats.failed_operations);
                println!(
                    "Tombstones:      {} ({} unacknowledged)",
                    stats.tombstones, stats.unacknowledged_tombstones
                );
                match stats.watermark {
                    Some(at) => println!("Watermark:       {}", at.to_rfc3339()),
                    None => println!("Watermark:       never pulled"),
                }
            }
        }
        Command::Pending => {
            let pending = db.list_pending().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("Queue is empty");
            } else {
                for op in pending {
                    let schedule = op
                        .next_attempt_at
                        .map(|at| format!(" next attempt {}", at.to_rfc3339()))
                        .unwrap_or_default();
                    println!(
                        "{} {:<6} entity {} queued {} retries {}{}",
                        op.id,
                        op.kind().as_str(),
                        op.entity_id,
                        op.created_at.to_rfc3339(),
                        op.retry_count,
                        schedule
                    );
                    if let Some(error) = op.last_error {
                        println!("    last error: {}", error);
                    }
                }
            }
        }
        Command::Failed => {
            let failed = db.list_failed().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&failed)?);
            } else if failed.is_empty() {
                println!("No failed operations");
            } else {
                for parked in failed {
                    println!(
                        "{} {:<6} entity {} failed {}: {}",
                        parked.operation.id,
                        parked.operation.kind().as_str(),
                        parked.operation.entity_id,
                        parked.failed_at.to_rfc3339(),
                        parked.error
                    );
                }
            }
        }
        Command::Retry { entity_id } => {
            let manager = OfflineManager::new(db.clone(), Arc::new(SystemClock));
            let restored = manager.retry_failed(entity_id).await?;
            println!("Re-queued {} operations for {}", restored, entity_id);
        }
        Command::PurgeTombstones { older_than_days } => {
            let retention = match older_than_days {
                Some(days) => chrono::Duration::days(i64::from(days)),
                None => config.tombstone_retention(),
            };
            let purged = db.purge_tombstones(Utc::now() - retention).await?;
            println!("Purged {} tombstones", purged);
        }
    }

    Ok(())
}
