//! Error types for ciboard-core
//!
//! Provides the error taxonomy with thiserror for graceful degradation:
//! cache-tier failures are recovered locally and never reach request
//! handlers; metrics failures only show up as gaps in exported samples.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for ciboard operations
#[derive(Error, Debug)]
pub enum CoreError {
    // ===================
    // Cache store
    // ===================
    /// The shared cache store could not be reached within its timeout.
    /// Callers treat this as a miss (read) or drop the write.
    #[error("Cache store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Failed to encode cached value for key {key}")]
    Serialize {
        key: String,
        #[source]
        source: bincode::Error,
    },

    #[error("Failed to decode cached value for key {key}")]
    Deserialize {
        key: String,
        #[source]
        source: bincode::Error,
    },

    // ===================
    // Invalidation
    // ===================
    /// An invalidation event could not be applied to the store.
    /// Retried on a bounded schedule; on exhaustion the affected
    /// namespaces fall back to a short forced TTL.
    #[error("Invalidation for {scope} failed: {message}")]
    InvalidationDelivery { scope: String, message: String },

    // ===================
    // Metrics
    // ===================
    #[error("Invalid metric name: {name}")]
    InvalidMetricName { name: String },

    /// A shard file failed validation during aggregation. The shard is
    /// skipped for the cycle; aggregation continues with the rest.
    #[error("Unreadable shard {path}: {reason}")]
    ShardRead { path: PathBuf, reason: String },

    #[error("Shard read timed out: {path}")]
    ShardReadTimeout { path: PathBuf },

    // ===================
    // IO
    // ===================
    #[error("Failed to write file: {path}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    /// Wrap a rusqlite error as a store-unavailable failure.
    pub(crate) fn store(message: impl Into<String>, source: rusqlite::Error) -> Self {
        CoreError::StoreUnavailable {
            message: message.into(),
            source: Some(source),
        }
    }
}
