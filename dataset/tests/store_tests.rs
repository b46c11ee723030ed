use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::collections::BTreeSet;
use tickgrid_dataset::error::DatasetError;
use tickgrid_dataset::store::PartitionStore;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn datetime(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
    date(y, m, d).and_hms_opt(h, mi, s).unwrap()
}

fn tick_frame() -> DataFrame {
    let df = df!(
        "date" => vec![date(2024, 1, 2), date(2024, 1, 2), date(2024, 1, 1), date(2024, 1, 1)],
        "symbol" => vec!["ETH", "BTC", "BTC", "ETH"],
        "time" => vec![
            datetime(2024, 1, 2, 10, 0, 5),
            datetime(2024, 1, 2, 10, 0, 0),
            datetime(2024, 1, 1, 9, 0, 0),
            datetime(2024, 1, 1, 8, 0, 0),
        ],
        "fair" => vec![3000.0, 50_000.0, 49_000.0, 2900.0],
    )
    .unwrap();
    df.lazy()
        .with_columns([col("time").cast(DataType::Datetime(TimeUnit::Microseconds, None))])
        .collect()
        .unwrap()
}

#[test]
fn partition_dir_follows_hive_naming() {
    let store = PartitionStore::new("/data/ticks", "*.parquet");
    assert_eq!(
        store.partition_dir(date(2024, 3, 7)),
        std::path::PathBuf::from("/data/ticks/date=2024-03-07")
    );
    assert!(store
        .validation_file()
        .ends_with("validated_partitions.json"));
}

#[test]
fn write_batch_then_scan_round_trips_per_date() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::new(dir.path(), "*.parquet");
    let dates = [date(2024, 1, 1), date(2024, 1, 2)];
    store
        .write_partition_batch(tick_frame().lazy(), &dates)
        .unwrap();

    for d in dates {
        assert!(store.partition_dir(d).is_dir());
        let df = store.scan_partition(d).unwrap().collect().unwrap();
        assert_eq!(df.height(), 2);
        let scanned: Vec<i32> = df
            .column("date")
            .unwrap()
            .as_materialized_series()
            .date()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        let expected = (d - date(1970, 1, 1)).num_days() as i32;
        assert!(scanned.iter().all(|days| *days == expected));
    }

    // rows inside a partition are sorted by time then symbol
    let df = store
        .scan_partition(date(2024, 1, 1))
        .unwrap()
        .collect()
        .unwrap();
    let symbols: Vec<&str> = df
        .column("symbol")
        .unwrap()
        .as_materialized_series()
        .str()
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(symbols, vec!["ETH", "BTC"]);
}

#[test]
fn scan_all_sees_every_partition() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::new(dir.path(), "*.parquet");
    let dates = [date(2024, 1, 1), date(2024, 1, 2)];
    store
        .write_partition_batch(tick_frame().lazy(), &dates)
        .unwrap();
    let df = store.scan_all().unwrap().collect().unwrap();
    assert_eq!(df.height(), 4);
}

#[test]
fn dates_without_rows_produce_no_partition() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::new(dir.path(), "*.parquet");
    let dates = [date(2024, 1, 1), date(2024, 1, 3)];
    store
        .write_partition_batch(tick_frame().lazy(), &dates)
        .unwrap();
    assert!(store.partition_dir(date(2024, 1, 1)).is_dir());
    assert!(!store.partition_dir(date(2024, 1, 3)).exists());
}

#[test]
fn scanning_a_missing_partition_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::new(dir.path(), "*.parquet");
    match store.scan_partition(date(2024, 1, 1)) {
        Err(DatasetError::ReadError { .. }) => {}
        Err(other) => panic!("expected ReadError, got {other:?}"),
        Ok(_) => panic!("expected ReadError, got Ok"),
    }
}

#[test]
fn validation_cache_round_trips_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::new(dir.path(), "*.parquet");
    assert!(store.load_validation_json().is_empty());

    let valid: BTreeSet<NaiveDate> =
        [date(2024, 1, 3), date(2024, 1, 1)].into_iter().collect();
    store.save_validation_json(&valid).unwrap();
    assert!(store.validation_file().is_file());

    let loaded = store.load_validation_json();
    assert_eq!(loaded, valid);

    let raw = std::fs::read_to_string(store.validation_file()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        parsed["valid_partitions"],
        serde_json::json!(["2024-01-01", "2024-01-03"])
    );
}

#[test]
fn corrupt_validation_cache_loads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::new(dir.path(), "*.parquet");
    std::fs::write(store.validation_file(), "not json").unwrap();
    assert!(store.load_validation_json().is_empty());
}

#[test]
fn delete_validation_cache_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::new(dir.path(), "*.parquet");
    store.delete_validation_json().unwrap();
    store
        .save_validation_json(&BTreeSet::from([date(2024, 1, 1)]))
        .unwrap();
    store.delete_validation_json().unwrap();
    assert!(!store.validation_file().exists());
}
