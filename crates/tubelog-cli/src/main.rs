use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tubelog_storage::{ReconcileStore, SqliteStore};
use tubelog_sync::{ConvergenceCollector, Shutdown, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "tubelog")]
#[command(about = "Track video metadata and comment revisions across repeated collection runs")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Overrides TUBELOG_FIXTURES_DIR.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect ids from the listing and reconcile every video and its comments.
    Sync {
        #[arg(long)]
        query: Option<String>,
    },
    /// Create or upgrade the database schema.
    Migrate,
    /// Run only the listing collector and print the ids it found.
    Collect,
    /// Print a stored video, its revision log and its comments as JSON.
    Show { video_id: String },
}

fn init_tracing() -> Result<()> {
    let filter = match std::env::var("TUBELOG_LOG") {
        Ok(directives) => EnvFilter::try_new(directives).context("parsing TUBELOG_LOG")?,
        Err(_) => EnvFilter::new("warn").add_directive("tubelog=info".parse()?),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

/// Shutdown handle that fires on Ctrl-C.
fn ctrl_c_shutdown() -> Shutdown {
    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current item");
            trigger.trigger();
        }
    });
    shutdown
}

async fn open_store(config: &SyncConfig) -> Result<SqliteStore> {
    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("migrating database schema")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(dir) = cli.fixtures {
        config.fixtures_dir = Some(dir);
    }

    match cli.command.unwrap_or(Commands::Sync { query: None }) {
        Commands::Sync { query } => {
            if let Some(query) = query {
                config.query = query;
            }
            let summary = tubelog_sync::run_sync_once(&config, &ctrl_c_shutdown()).await?;
            println!(
                "sync complete: run_id={} collected={} videos(+{} ~{} ={}) comments(+{} ~{} ={}) failed={}",
                summary.run_id,
                summary.collected_ids,
                summary.videos.inserted,
                summary.videos.updated,
                summary.videos.unchanged,
                summary.comments.inserted,
                summary.comments.updated,
                summary.comments.unchanged,
                summary.failed_ids.len()
            );
        }
        Commands::Migrate => {
            open_store(&config).await?;
            info!(database_url = %config.database_url, "schema is up to date");
        }
        Commands::Collect => {
            let feed = tubelog_sync::open_listing(&config)?;
            let collection = ConvergenceCollector::new(config.collector())
                .collect(&feed, &feed, &ctrl_c_shutdown())
                .await
                .context("collecting identifiers from listing")?;
            let mut ids: Vec<_> = collection.ids.into_iter().collect();
            ids.sort();
            for id in &ids {
                println!("{id}");
            }
            eprintln!(
                "{:?} after {} rounds, {} ids",
                collection.outcome,
                collection.rounds,
                ids.len()
            );
        }
        Commands::Show { video_id } => {
            let store = open_store(&config).await?;
            let video = store
                .get_video(&video_id)
                .await?
                .with_context(|| format!("no stored video {video_id}"))?;
            let snapshot = store.get_snapshot(&video_id).await?;
            let comments = store.list_comments(&video_id).await?;
            let view = serde_json::json!({
                "video": video,
                "revised_count": snapshot.map(|s| s.revised_count).unwrap_or(0),
                "comments": comments,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    Ok(())
}
