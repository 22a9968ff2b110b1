//! SQLite-backed TTL store shared by all worker processes
//!
//! The store is the one facility workers share: a WAL-mode SQLite file that
//! every worker opens independently. Entries carry a TTL and a generation
//! tag; a reader only sees an entry while it is inside its TTL window and
//! its generation is at least the namespace's current generation, so bulk
//! invalidation is an O(1) generation bump instead of a scan.
//!
//! Expiry is lazy (checked on read); capacity pressure evicts
//! least-recently-used entries on write and reports them through a counter,
//! never as an error to the caller. All operations are bounded by the
//! connection's busy timeout; a store that cannot be reached degrades to
//! a miss at the query-cache layer.
//!
//! Schema:
//! - entries: key, namespace, generation, value BLOB, created_at, ttl_ms, last_accessed
//! - namespaces: per-namespace generation counter + optional forced TTL
//!   ("possibly stale" fallback, see invalidation)
//! - store_metadata: schema version, auto-clear on mismatch

use crate::error::CoreError;
use crate::metrics::MetricsShard;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Current store schema version
///
/// Increment when the entry layout or visibility rules change; existing
/// entries are cleared on mismatch at open time.
const STORE_VERSION: i32 = 1;

const DB_FILE: &str = "query-cache.db";

/// Wall clock abstraction so TTL behavior is testable with a simulated clock.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the unix epoch.
    fn now_unix_ms(&self) -> i64;
}

/// Clock backed by the system time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Configuration for the TTL store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of entries before LRU eviction kicks in
    pub max_entries: usize,

    /// Bound on how long a single store operation may block on the
    /// database lock
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            busy_timeout: Duration::from_millis(250),
        }
    }
}

/// Process-shared TTL key/value store (thread-safe)
pub struct TtlStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    db_path: PathBuf,
    evictions: AtomicU64,
    metrics: Option<Arc<MetricsShard>>,
}

impl TtlStore {
    /// Create or open the store database under `cache_dir`.
    pub fn open(cache_dir: &Path, config: StoreConfig) -> Result<Self, CoreError> {
        Self::open_with_clock(cache_dir, config, Arc::new(SystemClock))
    }

    /// Like [`TtlStore::open`], with an injected clock (used by tests to
    /// simulate TTL expiry).
    pub fn open_with_clock(
        cache_dir: &Path,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(cache_dir).map_err(|source| CoreError::FileWrite {
            path: cache_dir.to_path_buf(),
            source,
        })?;

        let db_path = cache_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| CoreError::store(format!("open {}", db_path.display()), e))?;

        // WAL mode so workers can read while another writes
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| CoreError::store("enable WAL mode", e))?;
        conn.busy_timeout(config.busy_timeout)
            .map_err(|e| CoreError::store("set busy timeout", e))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS store_metadata (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                generation INTEGER NOT NULL,
                value BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                ttl_ms INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS namespaces (
                namespace TEXT PRIMARY KEY,
                generation INTEGER NOT NULL DEFAULT 0,
                forced_ttl_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_entries_namespace ON entries(namespace);
            CREATE INDEX IF NOT EXISTS idx_entries_last_accessed ON entries(last_accessed);
            "#,
        )
        .map_err(|e| CoreError::store("create schema", e))?;

        // Version check: clear stale entries on layout change
        let stored_version: Option<i32> = conn
            .query_row(
                "SELECT value FROM store_metadata WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CoreError::store("query store version", e))?;

        match stored_version {
            Some(v) if v != STORE_VERSION => {
                warn!(
                    stored = v,
                    current = STORE_VERSION,
                    "Store version mismatch, clearing entries"
                );
                conn.execute("DELETE FROM entries", [])
                    .map_err(|e| CoreError::store("clear stale entries", e))?;
                conn.execute(
                    "INSERT OR REPLACE INTO store_metadata (key, value) VALUES ('version', ?)",
                    params![STORE_VERSION],
                )
                .map_err(|e| CoreError::store("update store version", e))?;
            }
            None => {
                conn.execute(
                    "INSERT INTO store_metadata (key, value) VALUES ('version', ?)",
                    params![STORE_VERSION],
                )
                .map_err(|e| CoreError::store("initialize store version", e))?;
            }
            Some(_) => {}
        }

        debug!(path = %db_path.display(), "TTL store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            clock,
            db_path,
            evictions: AtomicU64::new(0),
            metrics: None,
        })
    }

    /// Attach a metrics shard; eviction counts are reported through it.
    pub fn with_metrics(mut self, metrics: Arc<MetricsShard>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Path of the underlying database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Store a value unconditionally (last writer wins).
    ///
    /// `generation` is the namespace generation the caller read *before*
    /// computing the value: if an invalidation bump lands while the value
    /// is being computed, the write goes through but stays invisible.
    pub fn put(
        &self,
        key: &str,
        namespace: &str,
        generation: i64,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CoreError> {
        let now = self.clock.now_unix_ms();
        let conn = self.conn.lock();

        conn.execute(
            "INSERT OR IGNORE INTO namespaces (namespace, generation) VALUES (?, 0)",
            params![namespace],
        )
        .map_err(|e| CoreError::store("ensure namespace", e))?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO entries
                (key, namespace, generation, value, created_at, ttl_ms, last_accessed)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                key,
                namespace,
                generation,
                value,
                now,
                ttl.as_millis() as i64,
                now
            ],
        )
        .map_err(|e| CoreError::store("insert entry", e))?;

        self.enforce_capacity(&conn, now)?;
        Ok(())
    }

    /// Retrieve a value if it is live: inside its TTL window (or the
    /// namespace's forced TTL, if marked possibly stale) and tagged with
    /// the namespace's current generation or newer.
    pub fn get(&self, key: &str, namespace: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let now = self.clock.now_unix_ms();
        let conn = self.conn.lock();

        let row: Option<(Vec<u8>, i64, i64, i64, i64, Option<i64>)> = conn
            .query_row(
                r#"
                SELECT e.value, e.created_at, e.ttl_ms, e.generation,
                       COALESCE(n.generation, 0), n.forced_ttl_ms
                FROM entries e
                LEFT JOIN namespaces n ON n.namespace = e.namespace
                WHERE e.key = ?
                "#,
                params![key],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| CoreError::store("query entry", e))?;

        let Some((value, created_at, ttl_ms, entry_gen, ns_gen, forced_ttl_ms)) = row else {
            debug!(key, namespace, "Cache miss");
            return Ok(None);
        };

        let effective_ttl = match forced_ttl_ms {
            Some(forced) => ttl_ms.min(forced),
            None => ttl_ms,
        };

        if now >= created_at + effective_ttl {
            // Lazy expiry: drop the dead row while we hold the lock
            conn.execute("DELETE FROM entries WHERE key = ?", params![key])
                .map_err(|e| CoreError::store("expire entry", e))?;
            debug!(key, "Cache entry expired");
            return Ok(None);
        }

        if entry_gen < ns_gen {
            debug!(key, entry_gen, ns_gen, "Cache entry invalidated by generation");
            return Ok(None);
        }

        conn.execute(
            "UPDATE entries SET last_accessed = ? WHERE key = ?",
            params![now, key],
        )
        .map_err(|e| CoreError::store("touch entry", e))?;

        debug!(key, "Cache hit");
        Ok(Some(value))
    }

    /// Remove a single entry.
    pub fn delete(&self, key: &str) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM entries WHERE key = ?", params![key])
            .map_err(|e| CoreError::store("delete entry", e))?;
        Ok(())
    }

    /// Remove all entries whose key starts with `prefix`. Returns the
    /// number of removed entries.
    pub fn delete_by_prefix(&self, prefix: &str) -> Result<usize, CoreError> {
        let pattern = format!("{}%", escape_like(prefix));
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "DELETE FROM entries WHERE key LIKE ? ESCAPE '\\'",
                params![pattern],
            )
            .map_err(|e| CoreError::store("delete by prefix", e))?;
        debug!(prefix, count, "Deleted entries by prefix");
        Ok(count)
    }

    /// Current generation of a namespace (0 if never written).
    pub fn generation(&self, namespace: &str) -> Result<i64, CoreError> {
        let conn = self.conn.lock();
        let gen: Option<i64> = conn
            .query_row(
                "SELECT generation FROM namespaces WHERE namespace = ?",
                params![namespace],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CoreError::store("query generation", e))?;
        Ok(gen.unwrap_or(0))
    }

    /// Raise a namespace's generation to at least `floor` (compare-and-set:
    /// `generation = MAX(generation, floor)`), making every entry tagged
    /// with an older generation invisible. Commutative and idempotent, so
    /// duplicate or reordered invalidation events are harmless. A
    /// successful bump also clears any "possibly stale" forced TTL.
    ///
    /// Returns true if the generation actually advanced.
    pub fn bump_generation(&self, namespace: &str, floor: i64) -> Result<bool, CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO namespaces (namespace, generation) VALUES (?1, ?2)
            ON CONFLICT(namespace) DO UPDATE
                SET generation = ?2, forced_ttl_ms = NULL
                WHERE namespaces.generation < ?2
            "#,
            params![namespace, floor],
        )
        .map_err(|e| CoreError::store("bump generation", e))?;

        Ok(conn.changes() > 0)
    }

    /// Mark a namespace as possibly stale: until the next successful
    /// generation bump, its entries are served with at most `forced_ttl`.
    pub fn mark_possibly_stale(
        &self,
        namespace: &str,
        forced_ttl: Duration,
    ) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO namespaces (namespace, generation, forced_ttl_ms) VALUES (?1, 0, ?2)
            ON CONFLICT(namespace) DO UPDATE SET forced_ttl_ms = ?2
            "#,
            params![namespace, forced_ttl.as_millis() as i64],
        )
        .map_err(|e| CoreError::store("mark namespace stale", e))?;
        warn!(namespace, "Namespace marked possibly stale, forced TTL active");
        Ok(())
    }

    /// Remove all entries (generations are preserved).
    pub fn clear(&self) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM entries", [])
            .map_err(|e| CoreError::store("clear entries", e))?;
        debug!("Store cleared");
        Ok(())
    }

    /// Store statistics for observability and the CLI.
    pub fn stats(&self) -> Result<StoreStats, CoreError> {
        let now = self.clock.now_unix_ms();
        let conn = self.conn.lock();

        let total_entries: i64 = conn
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
            .map_err(|e| CoreError::store("count entries", e))?;

        let live_entries: i64 = conn
            .query_row(
                r#"
                SELECT COUNT(*)
                FROM entries e
                LEFT JOIN namespaces n ON n.namespace = e.namespace
                WHERE e.created_at + MIN(e.ttl_ms, COALESCE(n.forced_ttl_ms, e.ttl_ms)) > ?
                  AND e.generation >= COALESCE(n.generation, 0)
                "#,
                params![now],
                |row| row.get(0),
            )
            .map_err(|e| CoreError::store("count live entries", e))?;

        let total_size: i64 = conn
            .query_row("SELECT SUM(LENGTH(value)) FROM entries", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        let namespace_count: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT namespace) FROM entries",
                [],
                |row| row.get(0),
            )
            .map_err(|e| CoreError::store("count namespaces", e))?;

        Ok(StoreStats {
            total_entries: total_entries as usize,
            live_entries: live_entries as usize,
            total_size_bytes: total_size as usize,
            namespace_count: namespace_count as usize,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }

    /// Evict down to capacity: dead entries first, then least recently used.
    fn enforce_capacity(&self, conn: &Connection, now: i64) -> Result<(), CoreError> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
            .map_err(|e| CoreError::store("count entries", e))?;

        let over = count - self.config.max_entries as i64;
        if over <= 0 {
            return Ok(());
        }

        let expired = conn
            .execute(
                "DELETE FROM entries WHERE created_at + ttl_ms <= ?",
                params![now],
            )
            .map_err(|e| CoreError::store("sweep expired entries", e))?;

        let still_over = over - expired as i64;
        let mut evicted = 0usize;
        if still_over > 0 {
            evicted = conn
                .execute(
                    r#"
                    DELETE FROM entries WHERE key IN (
                        SELECT key FROM entries ORDER BY last_accessed ASC LIMIT ?
                    )
                    "#,
                    params![still_over],
                )
                .map_err(|e| CoreError::store("evict LRU entries", e))?;
        }

        let total = expired + evicted;
        if total > 0 {
            self.evictions.fetch_add(total as u64, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.increment_by("ciboard_store_evictions_total", &[], total as u64);
            }
            debug!(expired, evicted, "Evicted entries under capacity pressure");
        }
        Ok(())
    }
}

impl Drop for TtlStore {
    fn drop(&mut self) {
        // Checkpoint so the WAL file does not grow unbounded across restarts
        let conn = self.conn.lock();
        if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE") {
            warn!("Failed to checkpoint WAL on TtlStore drop: {}", e);
        }
    }
}

/// Escape LIKE wildcards so a key prefix matches literally.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_entries: usize,
    /// Entries currently visible to readers (inside TTL, current generation)
    pub live_entries: usize,
    pub total_size_bytes: usize,
    pub namespace_count: usize,
    /// Entries removed under capacity pressure since this handle opened
    pub evictions: u64,
}
