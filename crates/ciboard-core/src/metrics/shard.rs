//! Per-worker metrics shard
//!
//! A shard is owned and mutated by exactly one process. Counters and
//! histograms live in DashMaps (per-entry locking, cheap under concurrent
//! request handlers); `snapshot()` is safe to call while writers are
//! active and may reflect values in flight at the boundary. State is
//! in-memory only, so a restarted worker starts from zero and the
//! aggregator sees a fresh series, never a negative delta.

use crate::error::CoreError;
use crate::metrics::{
    is_valid_label_name, is_valid_metric_name, MetricSample, SampleKey, SampleValue, ShardFile,
    SHARD_FORMAT_VERSION,
};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default histogram bucket bounds (seconds-scale latencies).
const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

struct Histogram {
    bounds: Arc<Vec<f64>>,
    /// Per-bucket counts plus a final overflow slot.
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: Arc<Vec<f64>>) -> Self {
        let slots = bounds.len() + 1;
        Self {
            bounds,
            counts: vec![0; slots],
            sum: 0.0,
            count: 0,
        }
    }

    fn record(&mut self, value: f64) {
        let idx = self.bounds.partition_point(|b| value > *b);
        self.counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }
}

/// Local metrics state for one worker process
pub struct MetricsShard {
    worker_id: String,
    counters: DashMap<SampleKey, u64>,
    histograms: DashMap<SampleKey, Histogram>,
    bucket_overrides: DashMap<String, Arc<Vec<f64>>>,
    default_bounds: Arc<Vec<f64>>,
}

impl MetricsShard {
    /// Create a shard with an explicit worker identity. The identity keys
    /// the shard's file in the registry directory, so it must be unique
    /// per live worker; characters outside `[A-Za-z0-9._-]` are replaced.
    pub fn new(worker_id: &str) -> Self {
        let worker_id: String = worker_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        Self {
            worker_id,
            counters: DashMap::new(),
            histograms: DashMap::new(),
            bucket_overrides: DashMap::new(),
            default_bounds: Arc::new(DEFAULT_BUCKETS.to_vec()),
        }
    }

    /// Shard identified by the current process id.
    pub fn for_process() -> Self {
        Self::new(&format!("worker-{}", std::process::id()))
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Use custom bucket bounds for a histogram name. Must be called
    /// before the first `observe` of that name to take effect.
    pub fn register_histogram(&self, name: &str, bounds: &[f64]) {
        self.bucket_overrides
            .insert(name.to_string(), Arc::new(bounds.to_vec()));
    }

    /// Increment a counter series by 1.
    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_by(name, labels, 1);
    }

    /// Increment a counter series by `n`.
    pub fn increment_by(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        if !self.check_series(name, labels) {
            return;
        }
        let key = SampleKey::new(name, labels);
        *self.counters.entry(key).or_insert(0) += n;
    }

    /// Record an observation into a histogram series.
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if !self.check_series(name, labels) {
            return;
        }
        if !value.is_finite() {
            warn!(name, value, "Dropping non-finite histogram observation");
            return;
        }
        let key = SampleKey::new(name, labels);
        let bounds = self.bounds_for(name);
        self.histograms
            .entry(key)
            .or_insert_with(|| Histogram::new(bounds))
            .record(value);
    }

    /// Ordered snapshot of all series. Safe concurrently with writers;
    /// a value incremented at the boundary may or may not be included.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples = Vec::with_capacity(self.counters.len() + self.histograms.len());

        for entry in self.counters.iter() {
            samples.push(MetricSample {
                name: entry.key().name.clone(),
                labels: entry.key().labels.clone(),
                value: SampleValue::Counter {
                    value: *entry.value(),
                },
            });
        }

        for entry in self.histograms.iter() {
            let h = entry.value();
            samples.push(MetricSample {
                name: entry.key().name.clone(),
                labels: entry.key().labels.clone(),
                value: SampleValue::Histogram {
                    bounds: h.bounds.as_ref().clone(),
                    counts: h.counts.clone(),
                    sum: h.sum,
                    count: h.count,
                },
            });
        }

        samples.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        samples
    }

    fn bounds_for(&self, name: &str) -> Arc<Vec<f64>> {
        self.bucket_overrides
            .get(name)
            .map(|b| Arc::clone(&b))
            .unwrap_or_else(|| Arc::clone(&self.default_bounds))
    }

    /// Metrics recording must never fail a request path: an invalid
    /// series is logged and dropped, leaving a gap the observability
    /// consumer can see.
    fn check_series(&self, name: &str, labels: &[(&str, &str)]) -> bool {
        if !is_valid_metric_name(name) {
            let e = CoreError::InvalidMetricName {
                name: name.to_string(),
            };
            warn!(error = %e, "Dropping sample");
            return false;
        }
        for (key, _) in labels {
            if !is_valid_label_name(key) {
                warn!(name, label = key, "Dropping sample with invalid label name");
                return false;
            }
        }
        true
    }
}

/// Write the shard's current snapshot into the registry directory.
///
/// The file is written to a temp sibling and renamed into place so the
/// aggregator never observes a torn document.
pub async fn write_shard_file(
    shard: &MetricsShard,
    registry_dir: &Path,
) -> Result<PathBuf, CoreError> {
    let file = ShardFile {
        version: SHARD_FORMAT_VERSION,
        worker_id: shard.worker_id().to_string(),
        pid: std::process::id(),
        written_at: chrono::Utc::now(),
        samples: shard.snapshot(),
    };

    let path = registry_dir.join(format!("{}.json", shard.worker_id()));
    let tmp = registry_dir.join(format!(".{}.json.tmp", shard.worker_id()));

    let json = serde_json::to_vec(&file).map_err(|e| CoreError::FileWrite {
        path: path.clone(),
        source: std::io::Error::other(e),
    })?;

    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|source| CoreError::FileWrite {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|source| CoreError::FileWrite {
            path: path.clone(),
            source,
        })?;

    debug!(path = %path.display(), samples = file.samples.len(), "Shard flushed");
    Ok(path)
}

/// Configuration for the background shard writer
#[derive(Debug, Clone)]
pub struct ShardWriterConfig {
    /// How often the shard snapshot is persisted to the registry
    pub flush_interval: Duration,
}

impl Default for ShardWriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
        }
    }
}

/// Background task that periodically persists a shard to the registry
/// directory; a final flush runs on graceful shutdown.
pub struct ShardWriter {
    shutdown_tx: mpsc::Sender<()>,
    path: PathBuf,
}

impl ShardWriter {
    /// Start flushing `shard` into `registry_dir`.
    pub fn start(
        shard: Arc<MetricsShard>,
        registry_dir: &Path,
        config: ShardWriterConfig,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(registry_dir).map_err(|source| CoreError::FileWrite {
            path: registry_dir.to_path_buf(),
            source,
        })?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let path = registry_dir.join(format!("{}.json", shard.worker_id()));
        let dir = registry_dir.to_path_buf();

        info!(
            worker_id = shard.worker_id(),
            dir = %dir.display(),
            "Shard writer started"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh worker
            // does not publish an empty shard before serving anything.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = write_shard_file(&shard, &dir).await {
                            warn!(error = %e, "Shard flush failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        if let Err(e) = write_shard_file(&shard, &dir).await {
                            warn!(error = %e, "Final shard flush failed");
                        }
                        info!("Shard writer shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self { shutdown_tx, path })
    }

    /// Registry path this writer flushes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush once more and stop the background task.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_counter_increments() {
        let shard = MetricsShard::new("w1");
        shard.increment("requests_total", &[("route", "/origins")]);
        shard.increment("requests_total", &[("route", "/origins")]);
        shard.increment("requests_total", &[("route", "/builds")]);

        let samples = shard.snapshot();
        assert_eq!(samples.len(), 2);
        // Sorted by label set: /builds before /origins
        assert_eq!(samples[0].value, SampleValue::Counter { value: 1 });
        assert_eq!(samples[1].value, SampleValue::Counter { value: 2 });
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let shard = MetricsShard::new("w1");
        shard.increment("b_total", &[]);
        shard.increment("a_total", &[]);

        let samples = shard.snapshot();
        assert_eq!(samples[0].name, "a_total");
        assert_eq!(samples[1].name, "b_total");
    }

    #[test]
    fn test_histogram_buckets() {
        let shard = MetricsShard::new("w1");
        shard.register_histogram("query_seconds", &[0.1, 1.0]);
        shard.observe("query_seconds", &[], 0.05);
        shard.observe("query_seconds", &[], 0.5);
        shard.observe("query_seconds", &[], 5.0);
        // Boundary value lands in its bucket, not the next
        shard.observe("query_seconds", &[], 0.1);

        let samples = shard.snapshot();
        assert_eq!(samples.len(), 1);
        match &samples[0].value {
            SampleValue::Histogram {
                bounds,
                counts,
                sum,
                count,
            } => {
                assert_eq!(bounds, &vec![0.1, 1.0]);
                assert_eq!(counts, &vec![2, 1, 1]);
                assert_eq!(*count, 4);
                assert!((sum - 5.65).abs() < 1e-9);
            }
            other => panic!("expected histogram, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_name_dropped() {
        let shard = MetricsShard::new("w1");
        shard.increment("not a name", &[]);
        shard.observe("9bad", &[], 1.0);
        assert!(shard.snapshot().is_empty());
    }

    #[test]
    fn test_worker_id_sanitized() {
        let shard = MetricsShard::new("web/worker 3");
        assert_eq!(shard.worker_id(), "web-worker-3");
    }

    #[tokio::test]
    async fn test_write_shard_file_roundtrip() {
        let dir = tempdir().unwrap();
        let shard = MetricsShard::new("w1");
        shard.increment("requests_total", &[("route", "/origins")]);

        let path = write_shard_file(&shard, dir.path()).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "w1.json");

        let raw = std::fs::read(&path).unwrap();
        let file: ShardFile = serde_json::from_slice(&raw).unwrap();
        file.validate().unwrap();
        assert_eq!(file.worker_id, "w1");
        assert_eq!(file.samples.len(), 1);

        // No temp file left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_shard_writer_final_flush_on_stop() {
        let dir = tempdir().unwrap();
        let shard = Arc::new(MetricsShard::new("w2"));
        let writer = ShardWriter::start(
            Arc::clone(&shard),
            dir.path(),
            ShardWriterConfig {
                flush_interval: Duration::from_secs(3600),
            },
        )
        .unwrap();

        shard.increment("requests_total", &[]);
        writer.stop().await;

        // Give the task a beat to process the shutdown flush
        tokio::time::sleep(Duration::from_millis(200)).await;

        let raw = std::fs::read(writer.path()).unwrap();
        let file: ShardFile = serde_json::from_slice(&raw).unwrap();
        assert_eq!(file.samples.len(), 1);
    }
}
