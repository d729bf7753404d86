//! Error types for the reconciliation engine.
//!
//! Recoverable data problems (malformed records, degenerate normalizations,
//! stale overrides) are not errors; they travel as `DataQualityIssue`s.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::SourceKind;

/// Unrecoverable failure of a reconciliation run.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The same source id appeared twice within one snapshot
    #[error("duplicate {kind} source id '{source_id}' in snapshot")]
    DuplicateSourceId { kind: SourceKind, source_id: String },

    /// Run aborted before commit
    #[error("run cancelled after {processed} of {total} digital records")]
    Cancelled { processed: usize, total: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A ledger row must be finished before it is appended
    #[error("import batch has no finished_at timestamp")]
    UnfinishedBatch,
}

/// Rejected override operations.
#[derive(Error, Debug)]
pub enum OverrideError {
    #[error("unknown {kind} record '{source_id}'")]
    UnknownRecord { kind: SourceKind, source_id: String },

    #[error("{kind} record '{source_id}' has no {missing} and cannot be matched")]
    MalformedRecord {
        kind: SourceKind,
        source_id: String,
        missing: &'static str,
    },

    #[error("physical record '{physical_source_id}' is already confirmed for '{claimed_by}'")]
    Conflict {
        physical_source_id: String,
        claimed_by: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for OverrideError {
    fn from(err: rusqlite::Error) -> Self {
        OverrideError::Store(StoreError::Sqlite(err))
    }
}

/// Invalid or unreadable configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("weights must be in [0,1] and sum to 1 (title={title}, artist={artist})")]
    InvalidWeights { title: f64, artist: f64 },

    #[error("thresholds must satisfy 1 >= exact > high > low > 0 (exact={exact}, high={high}, low={low})")]
    InvalidThresholds { exact: f64, high: f64, low: f64 },

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
