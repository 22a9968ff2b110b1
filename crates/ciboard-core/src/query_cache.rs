//! Query-result cache
//!
//! The sole caching entry point request handlers use: `cached` builds a
//! fingerprint key from the logical query name and normalized parameters,
//! returns the stored result on a hit, and otherwise runs the supplied
//! compute closure and stores its result with the given TTL.
//!
//! The cache is purely an optimization: every store failure degrades to
//! the miss path (reads) or a dropped write, so callers see the real
//! computation's result either way, just slower. `compute` is assumed
//! idempotent and side-effect-free; concurrent misses on one key may
//! both compute and both write, last writer wins.

use crate::error::CoreError;
use crate::fingerprint::fingerprint;
use crate::metrics::MetricsShard;
use crate::store::TtlStore;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Typed get-or-compute wrapper over the TTL store
pub struct QueryCache {
    store: Arc<TtlStore>,
    metrics: Arc<MetricsShard>,
}

impl QueryCache {
    pub fn new(store: Arc<TtlStore>, metrics: Arc<MetricsShard>) -> Self {
        Self { store, metrics }
    }

    /// Return the cached result for `(query_name, params)`, or compute,
    /// store, and return it.
    pub async fn cached<T, F, Fut>(
        &self,
        query_name: &str,
        params: &Value,
        ttl: Duration,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = fingerprint(query_name, params);

        match self.store.get(&key, query_name) {
            Ok(Some(bytes)) => match bincode::deserialize::<T>(&bytes) {
                Ok(value) => {
                    self.metrics
                        .increment("ciboard_cache_hits_total", &[("query", query_name)]);
                    return Ok(value);
                }
                Err(source) => {
                    // Stored under an older value layout: recompute and
                    // overwrite.
                    let e = CoreError::Deserialize {
                        key: key.clone(),
                        source,
                    };
                    warn!(error = %e, "Cached value failed to decode, recomputing");
                    self.metrics
                        .increment("ciboard_cache_decode_errors_total", &[("query", query_name)]);
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Cache store unreachable, treating as miss");
                self.metrics
                    .increment("ciboard_cache_store_errors_total", &[("query", query_name)]);
            }
        }

        // Read the generation before computing: if an invalidation bump
        // lands while the query runs, the write below stays invisible.
        let generation = match self.store.generation(query_name) {
            Ok(g) => g,
            Err(e) => {
                warn!(query_name, error = %e, "Generation read failed, tagging write with 0");
                0
            }
        };

        let value = compute().await?;
        self.metrics
            .increment("ciboard_cache_misses_total", &[("query", query_name)]);
        debug!(key = %key, "Cache miss, computed fresh result");

        match bincode::serialize(&value) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(&key, query_name, generation, &bytes, ttl) {
                    // Best effort: log and drop
                    warn!(key = %key, error = %e, "Cache write dropped");
                    self.metrics
                        .increment("ciboard_cache_store_errors_total", &[("query", query_name)]);
                }
            }
            Err(source) => {
                let e = CoreError::Serialize {
                    key: key.clone(),
                    source,
                };
                warn!(error = %e, "Result not serializable, skipping cache write");
            }
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn cache_in(dir: &std::path::Path) -> QueryCache {
        let store = Arc::new(TtlStore::open(dir, StoreConfig::default()).unwrap());
        QueryCache::new(store, Arc::new(MetricsShard::new("test")))
    }

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let result: Vec<String> = cache
                .cached("origin_listing", &json!({}), Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["maestro".to_string(), "redhat".to_string()])
                })
                .await
                .unwrap();
            assert_eq!(result, vec!["maestro", "redhat"]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_params_compute_separately() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());
        let calls = AtomicUsize::new(0);

        for limit in [10, 20] {
            let _: u64 = cache
                .cached(
                    "build_count",
                    &json!({ "limit": limit }),
                    Duration::from_secs(60),
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(limit)
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_equivalent_param_order_shares_entry() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());
        let calls = AtomicUsize::new(0);

        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();

        for params in [&a, &b] {
            let _: u64 = cache
                .cached("q", params, Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compute_error_propagates_and_caches_nothing() {
        let dir = tempdir().unwrap();
        let cache = cache_in(dir.path());
        let calls = AtomicUsize::new(0);

        let failed: Result<u64> = cache
            .cached("q", &json!({}), Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("database gone")
            })
            .await;
        assert!(failed.is_err());

        // The failure was not cached: the next call computes again
        let ok: u64 = cache
            .cached("q", &json!({}), Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(ok, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_undecodable_entry_recomputed() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TtlStore::open(dir.path(), StoreConfig::default()).unwrap());
        let cache = QueryCache::new(Arc::clone(&store), Arc::new(MetricsShard::new("test")));

        // Poison the entry with bytes that do not decode as a String
        let key = fingerprint("q", &json!({}));
        store
            .put(&key, "q", 0, &[0xff, 0xff, 0xff, 0xff, 0xff], Duration::from_secs(60))
            .unwrap();

        let value: String = cache
            .cached("q", &json!({}), Duration::from_secs(60), || async {
                Ok("fresh".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
    }

    #[tokio::test]
    async fn test_hit_and_miss_metrics() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TtlStore::open(dir.path(), StoreConfig::default()).unwrap());
        let metrics = Arc::new(MetricsShard::new("test"));
        let cache = QueryCache::new(store, Arc::clone(&metrics));

        for _ in 0..3 {
            let _: u64 = cache
                .cached("q", &json!({}), Duration::from_secs(60), || async { Ok(1) })
                .await
                .unwrap();
        }

        let samples = metrics.snapshot();
        let value_of = |name: &str| {
            samples
                .iter()
                .find(|s| s.name == name)
                .map(|s| match s.value {
                    crate::metrics::SampleValue::Counter { value } => value,
                    _ => 0,
                })
        };
        assert_eq!(value_of("ciboard_cache_misses_total"), Some(1));
        assert_eq!(value_of("ciboard_cache_hits_total"), Some(2));
    }
}
