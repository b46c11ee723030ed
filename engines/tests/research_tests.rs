use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use polars::prelude::*;
use std::sync::Arc;
use tickgrid_dataset::error::DatasetError;
use tickgrid_dataset::view::{BackendDataset, SymbolDomain, ViewConfig};
use tickgrid_engines::metadata::{MetadataConfig, MetadataExprs, MetadataSpec};
use tickgrid_engines::research::ResearchSpec;
use tickgrid_engines::returns::{BackendOptions, Mark, QueryOptions};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn datetime(d: NaiveDate, h: u32, mi: u32, s: u32) -> NaiveDateTime {
    d.and_hms_opt(h, mi, s).unwrap()
}

/// Hourly grid rows for two symbols on one date; doubles as index and
/// returns backend.
struct MemoryGrid {
    frame: DataFrame,
    universe: DataFrame,
    symbols: SymbolDomain,
}

impl MemoryGrid {
    fn new() -> Self {
        let d = date(2024, 1, 2);
        let symbols = ["A", "B"];
        let mut symbol_rows = Vec::new();
        let mut date_rows = Vec::new();
        let mut event_rows = Vec::new();
        let mut bucket_rows = Vec::new();
        let mut price_rows = Vec::new();
        for hour in 0..24u32 {
            for (i, symbol) in symbols.iter().enumerate() {
                symbol_rows.push(symbol.to_string());
                date_rows.push(d);
                event_rows.push(datetime(d, hour, 30, 0));
                bucket_rows.push(datetime(d, hour, 30, 0) + TimeDelta::minutes(30));
                price_rows.push(100.0 + hour as f64 + i as f64);
            }
        }
        let len = symbol_rows.len();
        let frame = df!(
            "symbol" => symbol_rows,
            "date" => date_rows,
            "time" => bucket_rows,
            "last_event_time" => event_rows,
            "vwap_price" => price_rows,
            "volume" => vec![1.0; len],
            "taker_buy_volume" => vec![0.5; len],
            "taker_sell_volume" => vec![0.5; len],
            "trade_count" => vec![5i64; len],
        )
        .unwrap()
        .lazy()
        .with_columns([
            col("time").cast(DataType::Datetime(TimeUnit::Microseconds, None)),
            col("last_event_time").cast(DataType::Datetime(TimeUnit::Microseconds, None)),
        ])
        .collect()
        .unwrap();
        let universe = df!(
            "date" => vec![d; symbols.len()],
            "symbol" => symbols.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        let domain = SymbolDomain::from_universe(&universe).unwrap();
        Self {
            frame,
            universe,
            symbols: domain,
        }
    }
}

impl BackendDataset for MemoryGrid {
    fn universe(&self) -> Result<DataFrame, DatasetError> {
        Ok(self.universe.clone())
    }

    fn lazyframe(&self, _validate: bool) -> Result<LazyFrame, DatasetError> {
        Ok(self.frame.clone().lazy())
    }

    fn symbols(&self) -> &SymbolDomain {
        &self.symbols
    }
}

fn metadata_config() -> MetadataConfig {
    MetadataConfig {
        returns_interval: TimeDelta::hours(1),
        grid_interval: TimeDelta::hours(1),
        metadata_exprs: MetadataExprs {
            by_symbol_index: vec![(
                TimeDelta::days(1),
                vec![(col("vwap_price") * col("volume")).sum().alias("liq_1d")],
            )],
            accum_returns: vec![(
                TimeDelta::days(1),
                vec![col("return").count().alias("ret_n_1d")],
            )],
        },
        quantile_expand: vec!["^liq_.*$".to_string()],
        last_event_time: col("last_event_time"),
        backend_fair: col("vwap_price"),
        filter_by_query_dates: true,
    }
}

#[test]
fn the_default_mark_table_covers_every_stock_horizon() {
    let marks = tickgrid_engines::research::default_mark_table();
    let names: Vec<&str> = marks.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "m1m_to_now",
            "m2m_to_now",
            "m5m_to_now",
            "m10m_to_now",
            "m20m_to_now",
            "m30m_to_now",
            "m1h_to_now",
            "m2h_to_now",
            "m3h_to_now",
            "m6h_to_now",
            "m12h_to_now",
            "m1d_to_now",
            "now_to_p1m",
            "now_to_p2m",
            "now_to_p5m",
            "now_to_p10m",
            "p1m_to_p2m",
            "p1m_to_p3m",
            "p1m_to_p6m",
            "p1m_to_p11m",
        ]
    );
    // horizons measured forward from their start in every case
    assert!(marks.iter().all(|(_, mark)| mark.duration > TimeDelta::zero()));
}

#[test]
fn research_dataset_joins_grid_returns_and_metadata() {
    let metadata_dir = tempfile::tempdir().unwrap();
    let research_dir = tempfile::tempdir().unwrap();
    let d = date(2024, 1, 2);
    let grid = Arc::new(MemoryGrid::new());

    let mut metadata = MetadataSpec::new(grid.clone(), metadata_config())
        .into_engine(ViewConfig::new(metadata_dir.path()).with_num_workers(2))
        .unwrap();
    metadata.compute(false, 30).unwrap();

    let spec = ResearchSpec::new(grid.clone(), grid.clone(), Arc::new(metadata))
        .with_marks(vec![(
            "now_to_p1h".to_string(),
            Mark::new(col("time"), TimeDelta::hours(1)),
        )])
        .with_backend_options(BackendOptions {
            fair: col("vwap_price"),
            time: col("last_event_time"),
        })
        .with_query_options(QueryOptions {
            tick_lag_tolerance: TimeDelta::hours(1),
            append_lag: false,
            ..QueryOptions::default()
        });
    let mut research = spec
        .into_dataset(ViewConfig::new(research_dir.path()).with_num_workers(2))
        .unwrap();
    research.compute(false, 30).unwrap();

    let df = research.get(Some(&[d])).unwrap().collect().unwrap();
    assert_eq!(df.height(), 48);
    for column in ["return_now_to_p1h", "liq_1d", "liq_1d_q", "vwap_price"] {
        assert!(
            df.column(column).is_ok(),
            "missing research column {column}"
        );
    }

    // a mid-day mark: start at bucket 12:00 finds the 11:30 event, end at
    // 13:00 finds 12:30; prices step by one per hour
    let row = df
        .clone()
        .lazy()
        .filter(
            col("symbol")
                .eq(lit("A"))
                .and(col("time").eq(lit(datetime(d, 12, 0, 0)))),
        )
        .collect()
        .unwrap();
    let ret = row
        .column("return_now_to_p1h")
        .unwrap()
        .as_materialized_series()
        .f64()
        .unwrap()
        .get(0)
        .unwrap();
    assert!((ret - 1.0 / 111.0).abs() < 1e-12);
}
