//! Cache invalidation coordinator
//!
//! Write paths call `notify_invalidation` (fire-and-forget) after a
//! successful data mutation; a single consumer task applies each event to
//! the shared store. Started once per process at worker boot, stopped
//! gracefully at worker shutdown: the loop goes Listening -> Processing
//! -> Listening and only exits on the shutdown signal, after the event
//! in flight has been applied.
//!
//! Table-scoped events use an O(1) generation bump (compare-and-set to
//! the event timestamp, so duplicates and reordering are harmless);
//! row-set and key-prefix events physically delete the affected key
//! prefixes. Invalidation is best-effort freshness, not read-after-write:
//! a failed event is retried on a bounded schedule and, if retries
//! exhaust, the affected namespaces fall back to a short forced TTL
//! instead of serving indefinitely stale data.

use crate::error::CoreError;
use crate::fingerprint::namespace_prefix;
use crate::metrics::MetricsShard;
use crate::store::TtlStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What part of the dataset an event invalidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    /// Any row of a table changed: every query family derived from it is
    /// invalidated via generation bump.
    Table { table: String },
    /// A known row set changed: the routed query families are dropped
    /// physically. The selector identifies the rows for traceability.
    RowSet { table: String, selector: String },
    /// Direct key-prefix invalidation for callers that know the exact
    /// prefix (for example one query family's namespace prefix).
    KeyPrefix { prefix: String },
}

impl std::fmt::Display for InvalidationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationScope::Table { table } => write!(f, "table:{}", table),
            InvalidationScope::RowSet { table, selector } => {
                write!(f, "row-set:{}:{}", table, selector)
            }
            InvalidationScope::KeyPrefix { prefix } => write!(f, "key-prefix:{}", prefix),
        }
    }
}

/// A "data changed" signal emitted by write paths.
///
/// `occurred_at` (unix ms) doubles as the generation floor for
/// table-scoped processing, which makes duplicate delivery a natural
/// no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub scope: InvalidationScope,
    pub occurred_at: i64,
}

impl InvalidationEvent {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            scope: InvalidationScope::Table {
                table: table.into(),
            },
            occurred_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn row_set(table: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            scope: InvalidationScope::RowSet {
                table: table.into(),
                selector: selector.into(),
            },
            occurred_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn key_prefix(prefix: impl Into<String>) -> Self {
        Self {
            scope: InvalidationScope::KeyPrefix {
                prefix: prefix.into(),
            },
            occurred_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Pin the event timestamp (duplicate-delivery tests).
    pub fn at(mut self, occurred_at: i64) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// Maps dataset tables to the query namespaces derived from them.
///
/// The routing is static configuration wired at worker start; an event
/// for an unrouted table invalidates nothing and logs a warning.
#[derive(Debug, Default, Clone)]
pub struct NamespaceRoutes {
    routes: HashMap<String, Vec<String>>,
}

impl NamespaceRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the query namespaces to invalidate when `table` changes.
    pub fn route<I, S>(mut self, table: impl Into<String>, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes
            .entry(table.into())
            .or_default()
            .extend(namespaces.into_iter().map(Into::into));
        self
    }

    pub fn namespaces_for(&self, table: &str) -> &[String] {
        self.routes.get(table).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Configuration for the invalidation coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Capacity of the event queue fed by write paths
    pub queue_capacity: usize,

    /// Attempts per event before giving up
    pub max_attempts: u32,

    /// Pause between attempts
    pub retry_delay: Duration,

    /// Forced TTL applied to namespaces whose invalidation could not be
    /// delivered
    pub stale_fallback_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            stale_fallback_ttl: Duration::from_secs(60),
        }
    }
}

/// Single-consumer invalidation loop, one per process lifetime
pub struct InvalidationCoordinator {
    event_tx: mpsc::Sender<InvalidationEvent>,
    shutdown_tx: mpsc::Sender<()>,
}

impl InvalidationCoordinator {
    /// Start the coordinator task.
    pub fn start(
        store: Arc<TtlStore>,
        routes: NamespaceRoutes,
        metrics: Arc<MetricsShard>,
        config: CoordinatorConfig,
    ) -> Self {
        let (event_tx, mut event_rx) = mpsc::channel::<InvalidationEvent>(config.queue_capacity);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        info!("Invalidation coordinator started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = event_rx.recv() => {
                        Self::process_event(&store, &routes, &metrics, &config, event).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Invalidation coordinator shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            event_tx,
            shutdown_tx,
        }
    }

    /// Fire-and-forget delivery from write paths. A full queue drops the
    /// event with a warning; producers re-emit on their next write
    /// (at-least-once is their concern, idempotence is ours).
    pub fn notify_invalidation(&self, event: InvalidationEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!(error = %e, "Invalidation event dropped, queue full or closed");
        }
    }

    /// Graceful shutdown: the event in flight finishes, then the loop
    /// exits.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn process_event(
        store: &TtlStore,
        routes: &NamespaceRoutes,
        metrics: &MetricsShard,
        config: &CoordinatorConfig,
        event: InvalidationEvent,
    ) {
        let scope = event.scope.to_string();

        for attempt in 1..=config.max_attempts {
            match apply_event(store, routes, &event) {
                Ok(()) => {
                    debug!(scope = %scope, attempt, "Invalidation applied");
                    metrics.increment("ciboard_invalidations_total", &[]);
                    return;
                }
                Err(e) => {
                    warn!(scope = %scope, attempt, error = %e, "Invalidation attempt failed");
                    if attempt < config.max_attempts {
                        tokio::time::sleep(config.retry_delay).await;
                    }
                }
            }
        }

        // Retries exhausted: cap how long the affected namespaces may
        // serve stale entries, then move on to the next event.
        let failure = CoreError::InvalidationDelivery {
            scope: scope.clone(),
            message: format!("{} attempts exhausted", config.max_attempts),
        };
        error!(error = %failure, "Invalidation failed, forcing short TTL");
        metrics.increment("ciboard_invalidation_failures_total", &[]);
        for namespace in affected_namespaces(routes, &event.scope) {
            if let Err(e) = store.mark_possibly_stale(&namespace, config.stale_fallback_ttl) {
                warn!(namespace = %namespace, error = %e, "Could not mark namespace possibly stale");
            }
        }
    }
}

/// Apply one event to the store. Idempotent: a duplicate delivery is a
/// no-op beyond the first application.
fn apply_event(
    store: &TtlStore,
    routes: &NamespaceRoutes,
    event: &InvalidationEvent,
) -> Result<(), CoreError> {
    match &event.scope {
        InvalidationScope::Table { table } => {
            let namespaces = routes.namespaces_for(table);
            if namespaces.is_empty() {
                warn!(table = %table, "No namespaces routed for table, nothing to invalidate");
            }
            for namespace in namespaces {
                let advanced = store.bump_generation(namespace, event.occurred_at)?;
                debug!(namespace = %namespace, advanced, "Generation bump");
            }
            Ok(())
        }
        InvalidationScope::RowSet { table, selector } => {
            let namespaces = routes.namespaces_for(table);
            if namespaces.is_empty() {
                warn!(table = %table, "No namespaces routed for table, nothing to invalidate");
            }
            for namespace in namespaces {
                let removed = store.delete_by_prefix(&namespace_prefix(namespace))?;
                debug!(namespace = %namespace, selector = %selector, removed, "Row-set invalidation");
            }
            Ok(())
        }
        InvalidationScope::KeyPrefix { prefix } => {
            let removed = store.delete_by_prefix(prefix)?;
            debug!(prefix = %prefix, removed, "Key-prefix invalidation");
            Ok(())
        }
    }
}

/// Namespaces an event touches, for the possibly-stale fallback.
fn affected_namespaces(routes: &NamespaceRoutes, scope: &InvalidationScope) -> Vec<String> {
    match scope {
        InvalidationScope::Table { table } | InvalidationScope::RowSet { table, .. } => {
            routes.namespaces_for(table).to_vec()
        }
        InvalidationScope::KeyPrefix { prefix } => {
            // A key prefix starts with its namespace segment
            prefix
                .split(':')
                .next()
                .filter(|ns| !ns.is_empty())
                .map(|ns| vec![ns.to_string()])
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::tempdir;

    fn test_store(dir: &std::path::Path) -> Arc<TtlStore> {
        Arc::new(TtlStore::open(dir, StoreConfig::default()).unwrap())
    }

    fn checkout_routes() -> NamespaceRoutes {
        NamespaceRoutes::new()
            .route("checkouts", ["origin_listing", "checkout_summary"])
            .route("builds", ["build_summary"])
    }

    #[test]
    fn test_routes_lookup() {
        let routes = checkout_routes();
        assert_eq!(
            routes.namespaces_for("checkouts"),
            ["origin_listing", "checkout_summary"]
        );
        assert!(routes.namespaces_for("unknown").is_empty());
    }

    #[test]
    fn test_table_event_bumps_all_routed_namespaces() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let routes = checkout_routes();

        store
            .put("origin_listing:k", "origin_listing", 0, b"v", Duration::from_secs(600))
            .unwrap();
        store
            .put("build_summary:k", "build_summary", 0, b"v", Duration::from_secs(600))
            .unwrap();

        let event = InvalidationEvent::table("checkouts").at(1_000);
        apply_event(&store, &routes, &event).unwrap();

        assert!(store.get("origin_listing:k", "origin_listing").unwrap().is_none());
        // Unrelated namespace untouched
        assert!(store.get("build_summary:k", "build_summary").unwrap().is_some());
    }

    #[test]
    fn test_duplicate_event_is_noop() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let routes = checkout_routes();

        let event = InvalidationEvent::table("checkouts").at(5_000);
        apply_event(&store, &routes, &event).unwrap();
        let gen_after_first = store.generation("origin_listing").unwrap();

        apply_event(&store, &routes, &event).unwrap();
        assert_eq!(store.generation("origin_listing").unwrap(), gen_after_first);
    }

    #[test]
    fn test_reordered_events_converge() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let routes = checkout_routes();

        let newer = InvalidationEvent::table("checkouts").at(9_000);
        let older = InvalidationEvent::table("checkouts").at(4_000);

        apply_event(&store, &routes, &newer).unwrap();
        apply_event(&store, &routes, &older).unwrap();

        assert_eq!(store.generation("origin_listing").unwrap(), 9_000);
    }

    #[test]
    fn test_row_set_event_deletes_prefixes() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let routes = checkout_routes();

        store
            .put("build_summary:a", "build_summary", 0, b"v", Duration::from_secs(600))
            .unwrap();
        store
            .put("origin_listing:a", "origin_listing", 0, b"v", Duration::from_secs(600))
            .unwrap();

        let event = InvalidationEvent::row_set("builds", "build=42");
        apply_event(&store, &routes, &event).unwrap();

        assert!(store.get("build_summary:a", "build_summary").unwrap().is_none());
        assert!(store.get("origin_listing:a", "origin_listing").unwrap().is_some());
    }

    #[test]
    fn test_key_prefix_event() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let routes = NamespaceRoutes::new();

        store
            .put("origin_listing:a", "origin_listing", 0, b"v", Duration::from_secs(600))
            .unwrap();

        let event = InvalidationEvent::key_prefix("origin_listing:");
        apply_event(&store, &routes, &event).unwrap();

        assert!(store.get("origin_listing:a", "origin_listing").unwrap().is_none());
    }

    #[test]
    fn test_affected_namespaces_from_prefix() {
        let routes = NamespaceRoutes::new();
        assert_eq!(
            affected_namespaces(
                &routes,
                &InvalidationScope::KeyPrefix {
                    prefix: "origin_listing:".to_string()
                }
            ),
            vec!["origin_listing".to_string()]
        );
    }

    #[tokio::test]
    async fn test_coordinator_processes_notifications() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let metrics = Arc::new(MetricsShard::new("test"));

        store
            .put("origin_listing:k", "origin_listing", 0, b"v", Duration::from_secs(600))
            .unwrap();

        let coordinator = InvalidationCoordinator::start(
            Arc::clone(&store),
            checkout_routes(),
            metrics,
            CoordinatorConfig::default(),
        );

        coordinator.notify_invalidation(InvalidationEvent::table("checkouts"));

        // Give the consumer task a beat
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(store.get("origin_listing:k", "origin_listing").unwrap().is_none());
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_unrouted_event_does_not_block_later_events() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path());
        let metrics = Arc::new(MetricsShard::new("test"));

        store
            .put("origin_listing:k", "origin_listing", 0, b"v", Duration::from_secs(600))
            .unwrap();

        let coordinator = InvalidationCoordinator::start(
            Arc::clone(&store),
            checkout_routes(),
            metrics,
            CoordinatorConfig::default(),
        );

        coordinator.notify_invalidation(InvalidationEvent::table("no_such_table"));
        coordinator.notify_invalidation(InvalidationEvent::table("checkouts"));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(store.get("origin_listing:k", "origin_listing").unwrap().is_none());
        coordinator.stop().await;
    }
}
