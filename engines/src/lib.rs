//! Tickgrid engines: research queries over date-partitioned tick datasets.
//!
//! The query path composes three layers, outermost first: a raw tick backend
//! is bucketed into a coarse grid ([`grid`]), returns over arbitrary mark
//! horizons are attached with causal asof joins ([`returns`]), and rolling
//! per-symbol aggregates are composed back onto the index grid
//! ([`metadata`]). [`research`] wires the three into one computed dataset.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Time-bucketed OHLCV/VWAP aggregation of raw ticks
pub mod grid;
/// Rolling per-symbol metadata with cross-sectional quantile ranks
pub mod metadata;
/// Research composition: index grid + batch returns + metadata
pub mod research;
/// Asof-join return computation over an irregular tick backend
pub mod returns;
