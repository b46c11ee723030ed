use crate::returns::{BackendOptions, Mark, QueryOptions, ReturnsEngine};
use chrono::{NaiveDate, TimeDelta};
use polars::prelude::*;
use polars::series::IsSorted;
use std::sync::Arc;
use tickgrid_dataset::dataset::ComputeSpec;
use tickgrid_dataset::error::DatasetError;
use tickgrid_dataset::time::{
    bucket_end, ceil_days, day_start, duration_string, interval_micros, intervals_per_day,
};
use tickgrid_dataset::view::{BackendDataset, DatasetView, ViewConfig, ViewSpec};
use tracing::debug;

/// Rolling aggregate declarations, keyed by lookback.
///
/// `by_symbol_index` runs against the raw backend on its event time;
/// `accum_returns` runs against the intermediate returns grid. Both are
/// evaluated as closed-left rolling windows grouped by symbol, so a value at
/// time `t` only ever sees ticks strictly before `t`.
#[derive(Clone)]
pub struct MetadataExprs {
    pub by_symbol_index: Vec<(TimeDelta, Vec<Expr>)>,
    pub accum_returns: Vec<(TimeDelta, Vec<Expr>)>,
}

/// The stock aggregate set: summed liquidity, sqrt-liquidity, excess-buy
/// ratio and trade count over 1d/7d; returns drift, volatility and the
/// volatility sample size over 7d/30d, normalized to daily frequency from
/// `returns_interval`.
pub fn default_metadata_exprs(returns_interval: TimeDelta) -> MetadataExprs {
    let liquidity = (col("vwap_price") * col("volume")).sum();
    let sqrtliq = liquidity.clone().pow(lit(0.5));
    let excess_buy_ratio =
        (col("taker_buy_volume") - col("taker_sell_volume")).sum() / col("volume").sum();
    let trade_count = col("trade_count").sum();

    let per_day = intervals_per_day(returns_interval) as f64;
    let drift = col("return").mean() * lit(per_day);
    let vol = col("return").std(1) * lit(per_day.sqrt());
    let vol_ssize = col("return").count();

    MetadataExprs {
        by_symbol_index: vec![
            (
                TimeDelta::days(1),
                vec![
                    liquidity.clone().alias("liquidity_1d"),
                    sqrtliq.clone().alias("sqrtliq_1d"),
                    excess_buy_ratio.clone().alias("excess_buy_ratio_1d"),
                    trade_count.clone().alias("trade_count_1d"),
                ],
            ),
            (
                TimeDelta::days(7),
                vec![
                    liquidity.alias("liquidity_7d"),
                    sqrtliq.alias("sqrtliq_7d"),
                    excess_buy_ratio.alias("excess_buy_ratio_7d"),
                    trade_count.alias("trade_count_7d"),
                ],
            ),
        ],
        accum_returns: vec![
            (
                TimeDelta::days(7),
                vec![
                    drift.clone().alias("daily_returns_drift_7d"),
                    vol.clone().alias("daily_vol_7d"),
                    vol_ssize.clone().alias("vol_ssize_7d"),
                ],
            ),
            (
                TimeDelta::days(30),
                vec![
                    drift.alias("daily_returns_drift_30d"),
                    vol.alias("daily_vol_30d"),
                    vol_ssize.alias("vol_ssize_30d"),
                ],
            ),
        ],
    }
}

/// Metadata engine configuration.
#[derive(Clone)]
pub struct MetadataConfig {
    /// Resolution of the intermediate returns grid.
    pub returns_interval: TimeDelta,
    /// Resolution of the emitted metadata table.
    pub grid_interval: TimeDelta,
    pub metadata_exprs: MetadataExprs,
    /// Regex column selectors; each match gets a cross-sectional `_q` sibling.
    pub quantile_expand: Vec<String>,
    /// Causal point-in-time timestamp inside the backend.
    pub last_event_time: Expr,
    /// Reference price handed to the returns engine.
    pub backend_fair: Expr,
    pub filter_by_query_dates: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        let returns_interval = TimeDelta::minutes(10);
        Self {
            returns_interval,
            grid_interval: TimeDelta::hours(1),
            metadata_exprs: default_metadata_exprs(returns_interval),
            quantile_expand: vec!["^daily_vol.*$".to_string(), "^liquidity.*$".to_string()],
            last_event_time: col("last_event_time"),
            backend_fair: col("vwap_price"),
            filter_by_query_dates: true,
        }
    }
}

/// Computed dataset of rolling per-symbol metadata.
///
/// The backend dataset supplies both the ticks the aggregates run on and the
/// universe; partitions are emitted at `grid_interval` with bucket-end
/// timestamps.
pub struct MetadataSpec {
    backend: Arc<dyn BackendDataset>,
    config: MetadataConfig,
}

impl MetadataSpec {
    pub fn new(backend: Arc<dyn BackendDataset>, config: MetadataConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &MetadataConfig {
        &self.config
    }

    pub fn into_engine(self, view: ViewConfig) -> Result<MetadataEngine, DatasetError> {
        DatasetView::new(self, view)
    }

    fn returns_engine(&self, backend_frame: LazyFrame) -> Result<ReturnsEngine, DatasetError> {
        ReturnsEngine::new(
            backend_frame,
            self.backend.symbols().clone(),
            BackendOptions {
                fair: self.config.backend_fair.clone(),
                time: self.config.last_event_time.clone(),
            },
        )
    }

    /// The `(symbol, date, returns_grid_time)` grid: every universe pair in
    /// range, stepped through the day at `returns_interval`.
    fn returns_grid(
        &self,
        from: NaiveDate,
        until: NaiveDate,
    ) -> Result<LazyFrame, DatasetError> {
        let pairs = self
            .backend
            .universe()?
            .lazy()
            .select([col("date"), col("symbol")])
            .group_by([col("date"), col("symbol")])
            .agg(Vec::<Expr>::new())
            .filter(col("date").is_between(lit(from), lit(until), ClosedInterval::Both));
        let step = interval_micros(self.config.returns_interval);
        let steps: Vec<i64> = (0..intervals_per_day(self.config.returns_interval))
            .map(|i| i * step)
            .collect();
        let steps = df!("step_us" => steps)?.lazy();
        let grid = pairs
            .join_builder()
            .with(steps)
            .how(JoinType::Cross)
            .finish()
            .with_columns([(col("date").cast(DataType::Datetime(TimeUnit::Microseconds, None))
                + col("step_us").cast(DataType::Duration(TimeUnit::Microseconds)))
            .alias("returns_grid_time")])
            .select([col("symbol"), col("date"), col("returns_grid_time")])
            .sort(["symbol", "returns_grid_time"], SortMultipleOptions::default());
        Ok(grid)
    }
}

fn max_lookback(entries: &[(TimeDelta, Vec<Expr>)]) -> TimeDelta {
    entries
        .iter()
        .map(|(lookback, _)| *lookback)
        .max()
        .unwrap_or_else(TimeDelta::zero)
}

/// Closed-left rolling window of `lookback` ending at each row: `[t - L, t)`.
fn rolling_options(index_column: &str, lookback: TimeDelta) -> RollingGroupOptions {
    RollingGroupOptions {
        index_column: index_column.into(),
        period: Duration::parse(&duration_string(lookback)),
        offset: Duration::parse(&format!("-{}", duration_string(lookback))),
        closed_window: ClosedWindow::Left,
        ..Default::default()
    }
}

impl ViewSpec for MetadataSpec {
    fn universe(&self) -> Result<DataFrame, DatasetError> {
        self.backend.universe()
    }
}

impl ComputeSpec for MetadataSpec {
    fn compute_partitions(&self, dates: &[NaiveDate]) -> Result<LazyFrame, DatasetError> {
        let start = *dates.iter().min().ok_or_else(|| {
            DatasetError::InvalidArgument("compute_partitions needs at least one date".to_string())
        })?;
        let end = *dates.iter().max().expect("non-empty dates");
        debug!("computing metadata for {start} to {end}");

        let backend_frame = self.backend.lazyframe(false)?;
        let engine = self.returns_engine(backend_frame.clone())?;
        let exprs = &self.config.metadata_exprs;

        // step 1: returns at returns_interval over the lookback-padded range
        let returns_from =
            start - TimeDelta::days(ceil_days(max_lookback(&exprs.accum_returns)));
        let grid = self.returns_grid(returns_from, end)?;
        let mark = Mark::new(col("returns_grid_time"), self.config.returns_interval);
        let query_options = QueryOptions {
            tick_lag_tolerance: self.config.returns_interval,
            append_lag: true,
            append_start_end_fairs: false,
            append_query_tick_times: false,
            filter_by_query_dates: self.config.filter_by_query_dates,
        };
        let with_returns = engine
            .query(grid, &mark, &query_options)?
            .sort(["symbol", "returns_grid_time"], SortMultipleOptions::default());

        // emitted buckets: ends inside (start, end + 1d], one bucket exactly once
        // across consecutive batches
        let window_lo = lit(day_start(start));
        let window_hi = lit(day_start(end + TimeDelta::days(1)));

        // step 2: rolling aggregates on the returns grid, one join per lookback
        let mut returns_meta = with_returns
            .clone()
            .select([col("symbol"), col("returns_grid_time")]);
        for (lookback, aggs) in &exprs.accum_returns {
            let rolled = with_returns
                .clone()
                .rolling(
                    col("returns_grid_time"),
                    [col("symbol")],
                    rolling_options("returns_grid_time", *lookback),
                )
                .agg(aggs.clone());
            returns_meta = returns_meta.join(
                rolled,
                [col("symbol"), col("returns_grid_time")],
                [col("symbol"), col("returns_grid_time")],
                JoinArgs::new(JoinType::Left),
            );
        }
        let returns_meta = returns_meta
            .with_columns([
                bucket_end(col("returns_grid_time"), self.config.grid_interval).alias("grid_time")
            ])
            .filter(col("grid_time").is_between(
                window_lo.clone(),
                window_hi.clone(),
                ClosedInterval::Right,
            ))
            .select([col("*").exclude(["returns_grid_time"])])
            .group_by([col("symbol"), col("grid_time")])
            .agg([all().last()])
            .sort(["symbol", "grid_time"], SortMultipleOptions::default());

        // step 3: rolling aggregates on the raw ticks
        let ticks_from =
            start - TimeDelta::days(ceil_days(max_lookback(&exprs.by_symbol_index)));
        let in_range = backend_frame
            .with_columns([self.config.last_event_time.clone().alias("last_event_time")])
            .filter(col("date").is_between(lit(ticks_from), lit(end), ClosedInterval::Both))
            .sort(["symbol", "last_event_time"], SortMultipleOptions::default());
        let mut tick_meta = in_range
            .clone()
            .select([col("symbol"), col("date"), col("last_event_time")]);
        for (lookback, aggs) in &exprs.by_symbol_index {
            let rolled = in_range
                .clone()
                .rolling(
                    col("last_event_time"),
                    [col("symbol")],
                    rolling_options("last_event_time", *lookback),
                )
                .agg(aggs.clone());
            tick_meta = tick_meta.join(
                rolled,
                [col("symbol"), col("last_event_time")],
                [col("symbol"), col("last_event_time")],
                JoinArgs::new(JoinType::Left),
            );
        }
        let tick_meta = tick_meta
            .with_columns([
                bucket_end(col("last_event_time"), self.config.grid_interval).alias("grid_time")
            ])
            .filter(col("grid_time").is_between(window_lo, window_hi, ClosedInterval::Right))
            .group_by([col("symbol"), col("grid_time")])
            .agg([all().last()])
            .sort(["symbol", "grid_time"], SortMultipleOptions::default());

        // steps 4-6: join, expand cross-sectional quantile ranks, emit at
        // bucket-end `time`
        let quantiles: Vec<Expr> = self
            .config
            .quantile_expand
            .iter()
            .map(|pattern| {
                (col(pattern.as_str())
                    .rank(
                        RankOptions {
                            method: RankMethod::Average,
                            descending: false,
                        },
                        None,
                    )
                    .cast(DataType::Float64)
                    / col(pattern.as_str()).count().cast(DataType::Float64))
                .name()
                .suffix("_q")
                .over([col("grid_time")])
            })
            .collect();
        let metadata = tick_meta
            .join(
                returns_meta,
                [col("symbol"), col("grid_time")],
                [col("symbol"), col("grid_time")],
                JoinArgs::new(JoinType::Inner),
            )
            .with_columns(quantiles)
            .with_columns([col("grid_time").alias("time")])
            .select([col("*").exclude(["grid_time"])])
            .sort(["symbol", "time"], SortMultipleOptions::default());
        Ok(metadata)
    }
}

/// A metadata dataset: `DatasetView` over a [`MetadataSpec`].
pub type MetadataEngine = DatasetView<MetadataSpec>;

/// Point-in-time composition of persisted metadata onto a query.
pub trait MetadataJoin {
    /// Backward asof join from the query onto the metadata table, matching by
    /// symbol: each row picks up the latest metadata at or before its time.
    fn append_metadata(
        &self,
        frame: LazyFrame,
        time_col: &str,
        symbol_col: &str,
    ) -> Result<LazyFrame, DatasetError>;
}

impl MetadataJoin for MetadataEngine {
    fn append_metadata(
        &self,
        frame: LazyFrame,
        time_col: &str,
        symbol_col: &str,
    ) -> Result<LazyFrame, DatasetError> {
        let metadata = self
            .lazyframe(true)?
            .sort(["symbol", "time"], SortMultipleOptions::default())
            .with_columns([col("time").set_sorted_flag(IsSorted::Ascending)]);
        let sort_keys = vec![PlSmallStr::from(symbol_col), PlSmallStr::from(time_col)];
        let joined = frame
            .sort(sort_keys, SortMultipleOptions::default())
            .with_columns([col(time_col).set_sorted_flag(IsSorted::Ascending)])
            .join_builder()
            .with(metadata)
            .left_on([col(time_col)])
            .right_on([col("time")])
            .how(JoinType::AsOf(AsOfOptions {
                strategy: AsofStrategy::Backward,
                left_by: Some(vec![symbol_col.into()]),
                right_by: Some(vec!["symbol".into()]),
                ..Default::default()
            }))
            .finish();
        Ok(joined)
    }
}
