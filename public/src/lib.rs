//! Tickgrid is the dataset engine of a crypto market-data research stack.
//!
//! It manages hive-partitioned parquet datasets keyed by trading date and
//! composes research queries over them:
//!
//! ```text
//! raw ticks ──▶ GridDataset ──▶ MetadataEngine ──▶ research output
//!    (hive)      (OHLCV grid)    (rolling aggregates)   (grid + returns + metadata)
//!                      └────────▶ ReturnsEngine ────────────┘
//! ```
//!
//! - `dataset` holds the partition lifecycle: discovery, validation with a
//!   persistent cache, and parallel (re)computation of per-date partitions.
//! - `engines` holds the query layers: bucket-end grid aggregation,
//!   asof-join return computation with lag guarantees, and rolling metadata
//!   with cross-sectional quantile ranks.

pub use tickgrid_dataset as dataset;
pub use tickgrid_engines as engines;

pub use chrono;
pub use polars;
