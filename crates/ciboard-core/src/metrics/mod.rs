//! Multi-process metrics
//!
//! Each worker owns a [`MetricsShard`] it alone mutates; a [`ShardWriter`]
//! persists snapshots to a shared registry directory; a standalone
//! [`MetricsAggregator`] merges all shard files into one
//! [`AggregatedSnapshot`] for the scrape endpoint. No shared memory
//! crosses a process boundary.

pub mod aggregator;
pub mod exposition;
pub mod shard;

pub use aggregator::{AggregatedSnapshot, AggregatorConfig, MetricsAggregator, SnapshotHandle};
pub use shard::{MetricsShard, ShardWriter, ShardWriterConfig};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shard file format version; readers skip files with a different version.
pub const SHARD_FORMAT_VERSION: u32 = 1;

static METRIC_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("valid regex"));

static LABEL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid regex"));

/// Metric name charset accepted by the text exposition format.
pub fn is_valid_metric_name(name: &str) -> bool {
    METRIC_NAME_RE.is_match(name)
}

pub fn is_valid_label_name(name: &str) -> bool {
    LABEL_NAME_RE.is_match(name)
}

/// Identity of a metric series: name plus label set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SampleKey {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl SampleKey {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Recorded value of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SampleValue {
    Counter {
        value: u64,
    },
    /// Bucket counts are per-bucket (not cumulative); `counts` has one
    /// slot per bound plus a final overflow slot. Exposition accumulates.
    Histogram {
        bounds: Vec<f64>,
        counts: Vec<u64>,
        sum: f64,
        count: u64,
    },
}

/// One series in a shard snapshot or aggregated snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: SampleValue,
}

impl MetricSample {
    fn validate(&self) -> Result<(), String> {
        if !is_valid_metric_name(&self.name) {
            return Err(format!("invalid metric name {:?}", self.name));
        }
        for key in self.labels.keys() {
            if !is_valid_label_name(key) {
                return Err(format!("invalid label name {:?} on {}", key, self.name));
            }
        }
        if let SampleValue::Histogram {
            bounds,
            counts,
            sum,
            ..
        } = &self.value
        {
            if counts.len() != bounds.len() + 1 {
                return Err(format!(
                    "histogram {} has {} counts for {} bounds",
                    self.name,
                    counts.len(),
                    bounds.len()
                ));
            }
            if !bounds.windows(2).all(|w| w[0] < w[1]) {
                return Err(format!("histogram {} bounds are not ascending", self.name));
            }
            if !sum.is_finite() {
                return Err(format!("histogram {} sum is not finite", self.name));
            }
        }
        Ok(())
    }
}

/// On-disk shard format: one JSON document per worker, replaced whole on
/// each flush (write-temp-then-rename, so readers never see a torn file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardFile {
    pub version: u32,
    pub worker_id: String,
    pub pid: u32,
    pub written_at: DateTime<Utc>,
    pub samples: Vec<MetricSample>,
}

impl ShardFile {
    /// Validate before merging; a failure skips the whole shard for the
    /// cycle (a transiently stale read is fine, a corrupt one is not).
    pub fn validate(&self) -> Result<(), String> {
        if self.version != SHARD_FORMAT_VERSION {
            return Err(format!(
                "unsupported shard version {} (expected {})",
                self.version, SHARD_FORMAT_VERSION
            ));
        }
        if self.worker_id.is_empty() {
            return Err("empty worker id".to_string());
        }
        for sample in &self.samples {
            sample.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_validation() {
        assert!(is_valid_metric_name("requests_total"));
        assert!(is_valid_metric_name("ciboard:cache_hits"));
        assert!(!is_valid_metric_name("9requests"));
        assert!(!is_valid_metric_name("requests-total"));
        assert!(!is_valid_metric_name(""));
    }

    #[test]
    fn test_shard_file_validation() {
        let mut file = ShardFile {
            version: SHARD_FORMAT_VERSION,
            worker_id: "worker-1".to_string(),
            pid: 1,
            written_at: Utc::now(),
            samples: vec![MetricSample {
                name: "requests_total".to_string(),
                labels: BTreeMap::new(),
                value: SampleValue::Counter { value: 3 },
            }],
        };
        assert!(file.validate().is_ok());

        file.version = 99;
        assert!(file.validate().is_err());
    }

    #[test]
    fn test_histogram_shape_validation() {
        let sample = MetricSample {
            name: "latency_seconds".to_string(),
            labels: BTreeMap::new(),
            value: SampleValue::Histogram {
                bounds: vec![0.1, 0.5],
                counts: vec![1, 2], // missing overflow slot
                sum: 0.7,
                count: 3,
            },
        };
        assert!(sample.validate().is_err());
    }
}
