//! ciboard-exporter - aggregation daemon with a scrape endpoint
//!
//! Runs the metrics aggregator as a singleton process and serves the
//! last published snapshot on `/metrics` in text exposition format. The
//! endpoint always answers from the last completed cycle, so a scrape
//! during an in-flight cycle sees a slightly older snapshot rather than
//! a partial one.

mod router;

pub use router::create_router;

use anyhow::{Context, Result};
use ciboard_core::metrics::{AggregatorConfig, MetricsAggregator};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Configuration for the exporter process
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Directory where workers drop their metric shard files
    pub registry_dir: PathBuf,

    /// Port for the scrape endpoint
    pub port: u16,

    /// Pause between aggregation cycles
    pub cycle_interval: Duration,

    /// Bound on reading a single shard file
    pub shard_read_timeout: Duration,
}

impl ExporterConfig {
    pub fn new(registry_dir: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            registry_dir: registry_dir.into(),
            port,
            cycle_interval: Duration::from_secs(15),
            shard_read_timeout: Duration::from_secs(2),
        }
    }
}

/// Run the aggregator and scrape endpoint until ctrl-c.
pub async fn run(config: ExporterConfig) -> Result<()> {
    let aggregator = MetricsAggregator::start(AggregatorConfig {
        registry_dir: config.registry_dir.clone(),
        cycle_interval: config.cycle_interval,
        shard_read_timeout: config.shard_read_timeout,
    });

    let router = create_router(aggregator.handle());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind scrape endpoint on {}", addr))?;

    info!(%addr, registry = %config.registry_dir.display(), "Scrape endpoint listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Scrape endpoint server error")?;

    // Let the in-flight aggregation cycle finish before exiting
    aggregator.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
