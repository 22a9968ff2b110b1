//! ciboard - CI dashboard backend toolbox

mod cli;

use anyhow::{Context, Result};
use ciboard_core::store::StoreConfig;
use ciboard_core::TtlStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ciboard",
    version,
    about = "CI dashboard backend toolbox",
    long_about = "Operational tooling for the ciboard backend: runs the metrics\n\
                  exporter (shard aggregation + scrape endpoint) and maintains the\n\
                  shared query cache.\n\
                  \n\
                  Examples:\n\
                    ciboard exporter                     # Aggregate shards, serve /metrics\n\
                    ciboard exporter --port 9102         # Custom scrape port\n\
                    ciboard cache-stats                  # Print query cache statistics\n\
                    ciboard cache-stats --json           # Machine-readable output\n\
                    ciboard clear-cache                  # Drop the shared query cache\n\
                  \n\
                  Environment Variables:\n\
                    CIBOARD_DATA_DIR                     # Override data directory\n\
                    CIBOARD_REGISTRY_DIR                 # Override metrics shard registry\n\
                    CIBOARD_EXPORTER_PORT                # Override scrape endpoint port\n\
                    RUST_LOG                             # Log filter (default: info)"
)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Data directory holding the cache and shard registry
    /// (default: platform data dir + /ciboard)
    #[arg(long, env = "CIBOARD_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the metrics exporter (aggregation loop + scrape endpoint)
    Exporter {
        /// Port for the scrape endpoint
        #[arg(long, default_value = "9102", env = "CIBOARD_EXPORTER_PORT")]
        port: u16,

        /// Seconds between aggregation cycles
        #[arg(long, default_value = "15")]
        interval_secs: u64,

        /// Shard registry directory (default: <data-dir>/metrics)
        #[arg(long, env = "CIBOARD_REGISTRY_DIR")]
        registry_dir: Option<PathBuf>,
    },
    /// Print query cache statistics
    CacheStats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete the shared query cache and exit
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let data_dir = cli
        .data_dir
        .or_else(|| dirs::data_local_dir().map(|d| d.join("ciboard")))
        .context("Could not determine data directory")?;

    match cli.mode {
        Mode::Exporter {
            port,
            interval_secs,
            registry_dir,
        } => {
            let registry_dir = registry_dir.unwrap_or_else(|| data_dir.join("metrics"));
            run_exporter(registry_dir, port, interval_secs).await?;
        }
        Mode::CacheStats { json } => {
            run_cache_stats(data_dir, json)?;
        }
        Mode::ClearCache => {
            run_clear_cache(data_dir)?;
        }
    }

    Ok(())
}

async fn run_exporter(registry_dir: PathBuf, port: u16, interval_secs: u64) -> Result<()> {
    std::fs::create_dir_all(&registry_dir).with_context(|| {
        format!("Failed to create registry directory: {}", registry_dir.display())
    })?;

    let mut config = ciboard_exporter::ExporterConfig::new(registry_dir, port);
    config.cycle_interval = Duration::from_secs(interval_secs.max(1));

    ciboard_exporter::run(config).await
}

fn run_cache_stats(data_dir: PathBuf, json: bool) -> Result<()> {
    let store = TtlStore::open(&data_dir.join("cache"), StoreConfig::default())
        .context("Failed to open query cache")?;
    let stats = store.stats().context("Failed to read cache statistics")?;

    println!("{}", cli::format_stats(&stats, json));
    Ok(())
}

fn run_clear_cache(data_dir: PathBuf) -> Result<()> {
    let cache_dir = data_dir.join("cache");
    let cache_path = cache_dir.join("query-cache.db");

    if !cache_path.exists() {
        println!("Cache not found at: {}", cache_path.display());
        println!("Nothing to clear.");
        return Ok(());
    }

    let size_bytes = std::fs::metadata(&cache_path)
        .with_context(|| format!("Failed to read cache metadata: {}", cache_path.display()))?
        .len();

    std::fs::remove_file(&cache_path)
        .with_context(|| format!("Failed to delete cache: {}", cache_path.display()))?;

    // Remove WAL siblings if present
    for suffix in ["-wal", "-shm"] {
        let sidecar = cache_dir.join(format!("query-cache.db{}", suffix));
        if sidecar.exists() {
            let _ = std::fs::remove_file(&sidecar);
        }
    }

    println!("✓ Cache cleared");
    println!("  Location: {}", cache_path.display());
    println!("  Freed: {}", cli::format_size(size_bytes));
    Ok(())
}
