use chrono::NaiveDate;
use polars::prelude::PolarsError;
use std::path::PathBuf;
use thiserror::Error;

/// Failure kinds surfaced by the partition lifecycle.
///
/// Missing data inside a query is never an error: staleness, unknown symbols
/// and pre-history are represented as NaN columns by the engines. The
/// variants here are reserved for the state machine around partitions.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A single partition failed the validity predicate.
    #[error("invalid partition {0}")]
    InvalidPartition(NaiveDate),

    /// One or more partitions were invalid after a batch check.
    #[error("validation failed for {count} partitions: {dates:?}", count = .0.len(), dates = .0)]
    ValidationFailure(Vec<NaiveDate>),

    /// One or more batches raised during computation.
    #[error("computation failed for {count} partitions: {dates:?}", count = .0.len(), dates = .0)]
    ComputationFailure(Vec<NaiveDate>),

    /// A required column is missing or carries the wrong dtype.
    #[error("schema mismatch: expected {expected}, found {actual}")]
    SchemaMismatch { expected: String, actual: String },

    /// Partition files are missing or unreadable. Consumed by the validity
    /// predicate to produce `false`; only escapes on direct reads.
    #[error("failed to read partition data at {}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: PolarsError,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
