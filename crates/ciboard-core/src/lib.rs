//! ciboard-core - Core library for ciboard
//!
//! Provides the query-result cache, invalidation coordinator, and
//! multi-process metrics shards/aggregation for the dashboard backend.

pub mod error;
pub mod fingerprint;
pub mod invalidation;
pub mod metrics;
pub mod query_cache;
pub mod store;

pub use error::CoreError;
pub use fingerprint::fingerprint;
pub use invalidation::{
    InvalidationCoordinator, InvalidationEvent, InvalidationScope, NamespaceRoutes,
};
pub use metrics::{
    AggregatedSnapshot, AggregatorConfig, MetricSample, MetricsAggregator, MetricsShard,
    ShardWriter, SnapshotHandle,
};
pub use query_cache::QueryCache;
pub use store::{StoreConfig, TtlStore};
