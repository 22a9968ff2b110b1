//! Metrics aggregator
//!
//! A singleton long-running loop, independent of request-serving workers:
//! each cycle it enumerates the shard registry, reads every worker's
//! shard file under a per-shard timeout, validates, and merges samples
//! with identical name and label set (counters by summation, histograms
//! bucket-wise). The merged snapshot is published whole into a
//! [`SnapshotHandle`]; publication is last-wins, so a second aggregator
//! instance cannot double-count a scrape, only overwrite with an
//! equivalent view.
//!
//! A shard that disappears mid-cycle contributes nothing this cycle; a
//! shard that fails validation is skipped and counted, never failing the
//! cycle. Merging is stateless re-summation of the current files, so a
//! restarted worker's reset shard is a new series rather than a negative
//! delta.

use crate::error::CoreError;
use crate::metrics::{MetricSample, SampleKey, SampleValue, ShardFile};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Configuration for the metrics aggregator
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Directory where workers drop their shard files
    pub registry_dir: PathBuf,

    /// Pause between aggregation cycles
    pub cycle_interval: Duration,

    /// Bound on reading a single shard file; kept shorter than the cycle
    /// interval so one slow shard cannot starve the cycle
    pub shard_read_timeout: Duration,
}

impl AggregatorConfig {
    pub fn new(registry_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry_dir: registry_dir.into(),
            cycle_interval: Duration::from_secs(15),
            shard_read_timeout: Duration::from_secs(2),
        }
    }
}

/// Merged view across all shard files at a point in time. Immutable once
/// published; superseded whole by the next cycle.
#[derive(Debug, Clone)]
pub struct AggregatedSnapshot {
    pub merged_at: DateTime<Utc>,
    pub cycle: u64,
    /// Shards that contributed this cycle
    pub shard_count: usize,
    /// Shards skipped this cycle (corrupt or unreadable)
    pub skipped_shards: usize,
    pub samples: Vec<MetricSample>,
}

impl AggregatedSnapshot {
    pub fn empty() -> Self {
        Self {
            merged_at: Utc::now(),
            cycle: 0,
            shard_count: 0,
            skipped_shards: 0,
            samples: Vec::new(),
        }
    }

    /// Value of a counter series, if present.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        let key = SampleKey::new(name, labels);
        self.samples
            .iter()
            .find(|s| s.name == key.name && s.labels == key.labels)
            .and_then(|s| match s.value {
                SampleValue::Counter { value } => Some(value),
                _ => None,
            })
    }
}

/// Shared handle to the most recently published snapshot.
///
/// The scrape endpoint reads the last successfully published snapshot,
/// so an in-flight cycle never leaves the endpoint empty-handed.
#[derive(Clone)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<AggregatedSnapshot>>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(AggregatedSnapshot::empty()))),
        }
    }

    pub fn current(&self) -> Arc<AggregatedSnapshot> {
        Arc::clone(&self.inner.read())
    }

    /// Last-wins publication; never patches a published snapshot.
    pub fn publish(&self, snapshot: Arc<AggregatedSnapshot>) {
        *self.inner.write() = snapshot;
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-running aggregation loop with graceful shutdown
pub struct MetricsAggregator {
    handle: SnapshotHandle,
    shutdown_tx: mpsc::Sender<()>,
}

impl MetricsAggregator {
    /// Start the aggregation loop.
    pub fn start(config: AggregatorConfig) -> Self {
        let handle = SnapshotHandle::new();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        info!(
            registry = %config.registry_dir.display(),
            interval_secs = config.cycle_interval.as_secs(),
            "Metrics aggregator started"
        );

        let loop_handle = handle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.cycle_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let mut cycle: u64 = 0;
            let mut corrupt_total: u64 = 0;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cycle += 1;
                        let snapshot = run_cycle(&config, cycle, &mut corrupt_total).await;
                        debug!(
                            cycle,
                            shards = snapshot.shard_count,
                            skipped = snapshot.skipped_shards,
                            series = snapshot.samples.len(),
                            "Aggregation cycle complete"
                        );
                        loop_handle.publish(Arc::new(snapshot));
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Metrics aggregator shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            handle,
            shutdown_tx,
        }
    }

    /// Handle for readers (the scrape endpoint).
    pub fn handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    /// Stop after the in-flight cycle finishes.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Run a single aggregation cycle without the loop (used by tests and
    /// one-shot tooling).
    pub async fn aggregate_once(config: &AggregatorConfig) -> AggregatedSnapshot {
        let mut corrupt_total = 0;
        run_cycle(config, 1, &mut corrupt_total).await
    }
}

async fn run_cycle(
    config: &AggregatorConfig,
    cycle: u64,
    corrupt_total: &mut u64,
) -> AggregatedSnapshot {
    let mut merged: BTreeMap<SampleKey, SampleValue> = BTreeMap::new();
    let mut shard_count = 0;
    let mut skipped = 0;

    for path in discover_shards(&config.registry_dir) {
        match read_shard(&path, config.shard_read_timeout).await {
            Ok(file) => {
                shard_count += 1;
                for sample in file.samples {
                    merge_sample(&mut merged, sample);
                }
            }
            Err(CoreError::ShardRead { ref reason, .. }) if reason.as_str() == "vanished" => {
                // Worker restarted between discovery and read: zero
                // contribution this cycle.
                debug!(path = %path.display(), "Shard vanished mid-cycle");
            }
            Err(e) => {
                skipped += 1;
                *corrupt_total += 1;
                warn!(path = %path.display(), error = %e, "Skipping unreadable shard");
            }
        }
    }

    // Aggregator self-observability rides along with the merged series
    merge_sample(
        &mut merged,
        MetricSample {
            name: "ciboard_aggregator_cycles_total".to_string(),
            labels: BTreeMap::new(),
            value: SampleValue::Counter { value: cycle },
        },
    );
    merge_sample(
        &mut merged,
        MetricSample {
            name: "ciboard_aggregator_corrupt_shard_reads_total".to_string(),
            labels: BTreeMap::new(),
            value: SampleValue::Counter {
                value: *corrupt_total,
            },
        },
    );

    let samples = merged
        .into_iter()
        .map(|(key, value)| MetricSample {
            name: key.name,
            labels: key.labels,
            value,
        })
        .collect();

    AggregatedSnapshot {
        merged_at: Utc::now(),
        cycle,
        shard_count,
        skipped_shards: skipped,
        samples,
    }
}

/// Enumerate shard files in the registry (top level only, `*.json`,
/// temp files excluded).
fn discover_shards(registry_dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(registry_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            name.ends_with(".json") && !name.starts_with('.')
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

async fn read_shard(path: &Path, timeout: Duration) -> Result<ShardFile, CoreError> {
    let raw = tokio::time::timeout(timeout, tokio::fs::read(path))
        .await
        .map_err(|_| CoreError::ShardReadTimeout {
            path: path.to_path_buf(),
        })?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::ShardRead {
                    path: path.to_path_buf(),
                    reason: "vanished".to_string(),
                }
            } else {
                CoreError::ShardRead {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        })?;

    let file: ShardFile = serde_json::from_slice(&raw).map_err(|e| CoreError::ShardRead {
        path: path.to_path_buf(),
        reason: format!("parse error: {}", e),
    })?;

    file.validate().map_err(|reason| CoreError::ShardRead {
        path: path.to_path_buf(),
        reason,
    })?;

    Ok(file)
}

fn merge_sample(merged: &mut BTreeMap<SampleKey, SampleValue>, sample: MetricSample) {
    let key = SampleKey {
        name: sample.name,
        labels: sample.labels,
    };

    match merged.entry(key) {
        std::collections::btree_map::Entry::Vacant(slot) => {
            slot.insert(sample.value);
        }
        std::collections::btree_map::Entry::Occupied(mut slot) => {
            if !merge_into(slot.get_mut(), sample.value) {
                warn!(
                    series = %slot.key().name,
                    "Dropping sample with mismatched kind or bucket bounds"
                );
            }
        }
    }
}

fn merge_into(existing: &mut SampleValue, incoming: SampleValue) -> bool {
    match (existing, incoming) {
        (SampleValue::Counter { value: existing }, SampleValue::Counter { value: incoming }) => {
            *existing += incoming;
            true
        }
        (
            SampleValue::Histogram {
                bounds: existing_bounds,
                counts: existing_counts,
                sum: existing_sum,
                count: existing_count,
            },
            SampleValue::Histogram {
                bounds,
                counts,
                sum,
                count,
            },
        ) if *existing_bounds == bounds => {
            for (slot_count, incoming) in existing_counts.iter_mut().zip(counts) {
                *slot_count += incoming;
            }
            *existing_sum += sum;
            *existing_count += count;
            true
        }
        (_, _) => false,
    }
}
