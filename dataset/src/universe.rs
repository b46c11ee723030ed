use crate::error::DatasetError;
use crate::time::date_from_days;
use chrono::NaiveDate;
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the cached universe inside a dataset root.
pub const UNIVERSE_FILE: &str = "universe.parquet";

/// Checks the minimum universe schema: `date: Date` and `symbol: String`.
/// Extra tracking columns (e.g. `hour` for intraday universes) are allowed.
pub fn check_universe_schema(universe: &DataFrame) -> Result<(), DatasetError> {
    let mismatch = |actual: String| DatasetError::SchemaMismatch {
        expected: "universe with `date: Date` and `symbol: String` columns".to_string(),
        actual,
    };
    let date = universe
        .column("date")
        .map_err(|_| mismatch("no `date` column".to_string()))?;
    if date.dtype() != &DataType::Date {
        return Err(mismatch(format!("`date` dtype {:?}", date.dtype())));
    }
    let symbol = universe
        .column("symbol")
        .map_err(|_| mismatch("no `symbol` column".to_string()))?;
    if symbol.dtype() != &DataType::String {
        return Err(mismatch(format!("`symbol` dtype {:?}", symbol.dtype())));
    }
    Ok(())
}

/// Distinct dates of a universe, ascending.
pub fn unique_dates(universe: &DataFrame) -> Result<Vec<NaiveDate>, DatasetError> {
    let column = universe.column("date")?.as_materialized_series();
    let mut days: Vec<i32> = column.date()?.into_iter().flatten().collect();
    days.sort_unstable();
    days.dedup();
    Ok(days.into_iter().map(date_from_days).collect())
}

/// Distinct symbols of a universe, lexicographically ascending.
pub fn unique_symbols(universe: &DataFrame) -> Result<Vec<String>, DatasetError> {
    let column = universe.column("symbol")?.as_materialized_series();
    let mut symbols: Vec<String> = column
        .str()?
        .into_iter()
        .flatten()
        .map(str::to_string)
        .collect();
    symbols.sort();
    symbols.dedup();
    Ok(symbols)
}

/// Creates a dataset root if missing; errors when the path exists but is not
/// a directory.
pub fn ensure_root(root: &Path) -> Result<(), DatasetError> {
    if root.exists() && !root.is_dir() {
        return Err(DatasetError::InvalidArgument(format!(
            "expected {} to be a directory",
            root.display()
        )));
    }
    fs::create_dir_all(root)?;
    Ok(())
}

/// Path of the cached universe file under a dataset root.
pub fn universe_path(root: &Path) -> PathBuf {
    root.join(UNIVERSE_FILE)
}

/// Reads a cached universe table.
pub fn read_universe(root: &Path) -> Result<DataFrame, DatasetError> {
    let path = universe_path(root);
    let file = fs::File::open(&path)?;
    let universe = ParquetReader::new(file).finish()?;
    check_universe_schema(&universe)?;
    Ok(universe)
}

/// Writes a universe table to its cache file, coercing `date` to the Date
/// dtype when a source hands over raw datetimes.
pub fn write_universe(root: &Path, universe: &DataFrame) -> Result<(), DatasetError> {
    ensure_root(root)?;
    let mut universe = universe.clone();
    let needs_date_cast = universe
        .column("date")
        .map(|column| column.dtype() != &DataType::Date)
        .unwrap_or(false);
    if needs_date_cast {
        universe = universe
            .lazy()
            .with_columns([col("date").cast(DataType::Date)])
            .collect()?;
    }
    check_universe_schema(&universe)?;
    let path = universe_path(root);
    let file = fs::File::create(&path)?;
    ParquetWriter::new(file).finish(&mut universe)?;
    Ok(())
}

/// Where fresh universes come from (an exchange catalogue, an object-store
/// listing, another dataset). Implementations may be slow or remote; results
/// are cached through [`load_or_fetch_universe`].
pub trait UniverseSource {
    fn fetch_universe(&self) -> anyhow::Result<DataFrame>;
}

/// Returns the cached universe at `root`, fetching and caching a fresh one
/// when the cache is missing or `refresh` is set.
pub fn load_or_fetch_universe(
    root: &Path,
    source: &dyn UniverseSource,
    refresh: bool,
) -> Result<DataFrame, DatasetError> {
    let path = universe_path(root);
    if !refresh && path.is_file() {
        return read_universe(root);
    }
    info!("fetching new universe for {}", root.display());
    let universe = source
        .fetch_universe()
        .map_err(|e| DatasetError::InvalidArgument(format!("universe fetch failed: {e:#}")))?;
    write_universe(root, &universe)?;
    let universe = read_universe(root)?;
    info!(
        "cached universe ({} rows) to {}",
        universe.height(),
        path.display()
    );
    Ok(universe)
}
