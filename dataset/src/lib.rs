//! Tickgrid dataset: date-partitioned parquet datasets with a persistent
//! validation cache and parallel (re)computation of missing partitions.
//!
//! A dataset is a directory of hive partitions (`{root}/date=YYYY-MM-DD/`)
//! described by a universe of `(date, symbol)` pairs. Read-only access goes
//! through [`view::DatasetView`]; datasets that know how to build their own
//! partitions implement [`dataset::ComputeSpec`] on top of it.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Batch materialization of missing partitions through the `ComputeSpec` hook
pub mod dataset;
/// Typed failure kinds of the partition lifecycle
pub mod error;
/// Worker-pool fan-out with ordered result collection
pub mod executor;
/// On-disk hive layout, per-date reads and writes, validation cache file
pub mod store;
/// Conversions between chrono intervals and polars expressions
pub mod time;
/// Universe catalogues and their parquet cache
pub mod universe;
/// Read-only partitioned views: validation state machine and lazy composition
pub mod view;
