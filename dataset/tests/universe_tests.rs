use chrono::NaiveDate;
use polars::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use tickgrid_dataset::error::DatasetError;
use tickgrid_dataset::universe::{
    check_universe_schema, load_or_fetch_universe, read_universe, unique_dates, unique_symbols,
    universe_path, write_universe, UniverseSource,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn sample_universe() -> DataFrame {
    df!(
        "date" => vec![date(2024, 1, 2), date(2024, 1, 1), date(2024, 1, 1)],
        "symbol" => vec!["ETH", "BTC", "ETH"],
    )
    .unwrap()
}

struct CountingSource {
    fetches: AtomicUsize,
}

impl CountingSource {
    fn new() -> Self {
        Self {
            fetches: AtomicUsize::new(0),
        }
    }
}

impl UniverseSource for CountingSource {
    fn fetch_universe(&self) -> anyhow::Result<DataFrame> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(sample_universe())
    }
}

#[test]
fn schema_check_requires_date_and_symbol() {
    check_universe_schema(&sample_universe()).unwrap();

    let missing = df!("date" => vec![date(2024, 1, 1)]).unwrap();
    assert!(matches!(
        check_universe_schema(&missing),
        Err(DatasetError::SchemaMismatch { .. })
    ));

    let wrong_dtype = df!(
        "date" => vec!["2024-01-01"],
        "symbol" => vec!["BTC"],
    )
    .unwrap();
    assert!(matches!(
        check_universe_schema(&wrong_dtype),
        Err(DatasetError::SchemaMismatch { .. })
    ));
}

#[test]
fn unique_dates_and_symbols_are_sorted_and_deduped() {
    let universe = sample_universe();
    assert_eq!(
        unique_dates(&universe).unwrap(),
        vec![date(2024, 1, 1), date(2024, 1, 2)]
    );
    assert_eq!(unique_symbols(&universe).unwrap(), vec!["BTC", "ETH"]);
}

#[test]
fn universe_cache_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    write_universe(dir.path(), &sample_universe()).unwrap();
    assert!(universe_path(dir.path()).is_file());
    let loaded = read_universe(dir.path()).unwrap();
    assert_eq!(loaded.height(), 3);
    check_universe_schema(&loaded).unwrap();
}

#[test]
fn load_or_fetch_prefers_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let source = CountingSource::new();

    let first = load_or_fetch_universe(dir.path(), &source, false).unwrap();
    assert_eq!(first.height(), 3);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

    // second load hits the parquet cache
    let second = load_or_fetch_universe(dir.path(), &source, false).unwrap();
    assert_eq!(second.height(), 3);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

    // refresh bypasses it
    load_or_fetch_universe(dir.path(), &source, true).unwrap();
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
}
