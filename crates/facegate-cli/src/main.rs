use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::dedup::{content_hash, cooldown_key, lock_key};
use facegate_core::sqlite::SqliteStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facegate", about = "Inspect facegate audit events, registered persons and dedup keys")]
struct Cli {
    /// Path to the facegate SQLite database
    #[arg(long, global = true, env = "FACEGATE_DB_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the most recent audit events, newest first
    Events {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List auto-registered persons, newest first
    Persons {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show row counts
    Stats,
    /// Print the content hash and dedup keys for a picture payload file
    Hash {
        /// File holding the base64 `pic` payload exactly as the camera sends it
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli
        .db
        .unwrap_or_else(|| facegate_core::default_data_dir().join("facegate.db"));

    match cli.command {
        Commands::Events { limit } => {
            let store = open(&db_path).await?;
            let events = store.recent_events(limit).await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Commands::Persons { limit } => {
            let store = open(&db_path).await?;
            let persons = store.persons(limit).await?;
            println!("{}", serde_json::to_string_pretty(&persons)?);
        }
        Commands::Stats => {
            let store = open(&db_path).await?;
            let stats = serde_json::json!({
                "database": db_path.display().to_string(),
                "events": store.count_events().await?,
                "persons": store.count_persons().await?,
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Hash { file } => {
            let payload = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let hash = content_hash(payload.trim_end());
            let keys = serde_json::json!({
                "hash": hash,
                "lock_key": lock_key(&hash),
                "cooldown_key": cooldown_key(&hash),
            });
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
    }

    Ok(())
}

async fn open(path: &std::path::Path) -> Result<SqliteStore> {
    if !path.exists() {
        anyhow::bail!("database not found at {}", path.display());
    }
    SqliteStore::open(path)
        .await
        .with_context(|| format!("failed to open database {}", path.display()))
}
