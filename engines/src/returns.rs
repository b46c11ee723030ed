use chrono::{NaiveDate, TimeDelta};
use polars::prelude::*;
use polars::series::IsSorted;
use tickgrid_dataset::error::DatasetError;
use tickgrid_dataset::time::duration_lit;
use tickgrid_dataset::view::SymbolDomain;

const ROW_ID: &str = "row_id";
const MARK: &str = "mark";

/// Backend column selection: which expressions carry the reference price and
/// the causal point-in-time timestamp of a tick.
#[derive(Clone)]
pub struct BackendOptions {
    pub fair: Expr,
    pub time: Expr,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            fair: col("vwap_price"),
            time: col("last_event_time"),
        }
    }
}

/// One mark horizon: where a return starts and how long it runs.
#[derive(Clone)]
pub struct Mark {
    pub start_time: Expr,
    pub duration: TimeDelta,
}

impl Mark {
    pub fn new(start_time: Expr, duration: TimeDelta) -> Self {
        Self {
            start_time,
            duration,
        }
    }
}

/// Per-query options. Flags select diagnostic columns; the date filter is a
/// pushdown only and never changes results.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub tick_lag_tolerance: TimeDelta,
    pub append_lag: bool,
    pub append_start_end_fairs: bool,
    pub append_query_tick_times: bool,
    pub filter_by_query_dates: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            tick_lag_tolerance: TimeDelta::seconds(30),
            append_lag: true,
            append_start_end_fairs: false,
            append_query_tick_times: false,
            filter_by_query_dates: true,
        }
    }
}

/// Causal point-in-time returns over an irregular tick-time backend.
///
/// Every query expands into start/end events, picks up the most recent tick
/// at or before each event with one backward asof join per call, and reduces
/// back to one row per input row. Absence is never an error: a stale tick, a
/// symbol outside the backend universe or a query before the first tick all
/// surface as NaN returns.
pub struct ReturnsEngine {
    db: LazyFrame,
    symbols: SymbolDomain,
}

impl ReturnsEngine {
    /// Builds an engine over a backend frame carrying `date`, `symbol` and
    /// the columns named by `options`. Only `{date, symbol, tick_time, fair}`
    /// are retained.
    pub fn new(
        db: LazyFrame,
        symbols: SymbolDomain,
        options: BackendOptions,
    ) -> Result<Self, DatasetError> {
        let mut db = db;
        let schema = db.collect_schema()?;
        if schema.get("date").is_none() || schema.get("symbol").is_none() {
            return Err(DatasetError::SchemaMismatch {
                expected: "backend with `date` and `symbol` columns".to_string(),
                actual: format!("{:?}", schema.iter_names().collect::<Vec<_>>()),
            });
        }
        let db = db.select([
            col("date"),
            col("symbol"),
            options.time.alias("tick_time"),
            options.fair.alias("fair"),
        ]);
        Ok(Self { db, symbols })
    }

    /// The backend's symbol universe.
    pub fn symbols(&self) -> &SymbolDomain {
        &self.symbols
    }

    /// Computes one return per input row over a single mark horizon.
    ///
    /// The output keeps every input row and column and appends `return` plus
    /// the diagnostics selected in `options`. Rows whose symbol is outside
    /// the backend universe are dropped before the join and come back as NaN.
    pub fn query(
        &self,
        query: LazyFrame,
        mark: &Mark,
        options: &QueryOptions,
    ) -> Result<LazyFrame, DatasetError> {
        let query_idx = self.indexed_query(query)?;
        let spans = self.mark_spans(query_idx.clone(), mark, None)?;
        let events = long_events(vec![spans], false)?;
        let bounds = if options.filter_by_query_dates {
            self.query_date_bounds(&query_idx, std::slice::from_ref(mark))?
        } else {
            None
        };
        let joined = asof_with_staleness(events, self.in_range_db(bounds), options);
        let metrics = metric_names(options);
        let mut reduced_cols: Vec<Expr> = vec![col(ROW_ID)];
        reduced_cols.extend(metrics.iter().map(|name| col(name.as_str())));
        let reduced = joined
            .group_by([col(ROW_ID), col("symbol")])
            .agg(reduction_exprs(options))
            .select(reduced_cols);
        let fills: Vec<Expr> = float_metric_names(options)
            .into_iter()
            .map(|name| col(name.as_str()).fill_null(lit(f64::NAN)))
            .collect();
        let result = query_idx
            .join(
                reduced,
                [col(ROW_ID)],
                [col(ROW_ID)],
                JoinArgs::new(JoinType::Left),
            )
            .with_columns(fills)
            .sort([ROW_ID], SortMultipleOptions::default())
            .select([col("*").exclude([ROW_ID])]);
        Ok(result)
    }

    /// Computes every requested horizon in one pass over the backend.
    ///
    /// `marks` maps a return name to its horizon; each metric column comes
    /// back suffixed with the name (`return_p1m_to_p11m`, …). One asof join
    /// total regardless of horizon count; the wide pivot stays lazy.
    pub fn query_batch(
        &self,
        query: LazyFrame,
        marks: &[(String, Mark)],
        options: &QueryOptions,
    ) -> Result<LazyFrame, DatasetError> {
        if marks.is_empty() {
            return Err(DatasetError::InvalidArgument(
                "query_batch needs at least one mark".to_string(),
            ));
        }
        let query_idx = self.indexed_query(query)?;
        let spans = marks
            .iter()
            .map(|(name, mark)| self.mark_spans(query_idx.clone(), mark, Some(name)))
            .collect::<Result<Vec<_>, _>>()?;
        let events = long_events(spans, true)?;
        let bounds = if options.filter_by_query_dates {
            let all: Vec<Mark> = marks.iter().map(|(_, mark)| mark.clone()).collect();
            self.query_date_bounds(&query_idx, &all)?
        } else {
            None
        };
        let joined = asof_with_staleness(events, self.in_range_db(bounds), options);
        let metrics = metric_names(options);
        let mut reduced_cols: Vec<Expr> = vec![col(ROW_ID), col(MARK)];
        reduced_cols.extend(metrics.iter().map(|name| col(name.as_str())));
        let reduced = joined
            .group_by([col(ROW_ID), col("symbol"), col(MARK)])
            .agg(reduction_exprs(options))
            .select(reduced_cols);

        let mut wide = query_idx;
        let mut fills: Vec<Expr> = Vec::new();
        for (name, _) in marks {
            let mut mark_cols: Vec<Expr> = vec![col(ROW_ID)];
            mark_cols.extend(
                metrics
                    .iter()
                    .map(|metric| col(metric.as_str()).alias(format!("{metric}_{name}").as_str())),
            );
            let per_mark = reduced
                .clone()
                .filter(col(MARK).eq(lit(name.as_str())))
                .select(mark_cols);
            wide = wide.join(
                per_mark,
                [col(ROW_ID)],
                [col(ROW_ID)],
                JoinArgs::new(JoinType::Left),
            );
            fills.extend(
                float_metric_names(options)
                    .into_iter()
                    .map(|metric| {
                        col(format!("{metric}_{name}").as_str()).fill_null(lit(f64::NAN))
                    }),
            );
        }
        let result = wide
            .with_columns(fills)
            .sort([ROW_ID], SortMultipleOptions::default())
            .select([col("*").exclude([ROW_ID])]);
        Ok(result)
    }

    fn indexed_query(&self, query: LazyFrame) -> Result<LazyFrame, DatasetError> {
        let mut query = query;
        let schema = query.collect_schema()?;
        if schema.get("symbol").is_none() {
            return Err(DatasetError::SchemaMismatch {
                expected: "query with a `symbol` column".to_string(),
                actual: format!("{:?}", schema.iter_names().collect::<Vec<_>>()),
            });
        }
        Ok(query.with_row_index(PlSmallStr::from_static(ROW_ID), None))
    }

    /// One row per in-universe query row with its start and end times.
    /// Out-of-universe symbols drop out here and are restored as NaN by the
    /// final left join.
    fn mark_spans(
        &self,
        query_idx: LazyFrame,
        mark: &Mark,
        name: Option<&str>,
    ) -> Result<LazyFrame, DatasetError> {
        let mut spans = query_idx
            .select([
                col("symbol"),
                col(ROW_ID),
                mark.start_time.clone().alias("start_time"),
            ])
            .join(
                self.symbols.frame()?,
                [col("symbol")],
                [col("symbol")],
                JoinArgs::new(JoinType::Semi),
            )
            .with_columns([(col("start_time") + duration_lit(mark.duration)).alias("end_time")]);
        if let Some(name) = name {
            spans = spans.with_columns([lit(name).alias(MARK)]);
        }
        Ok(spans)
    }

    /// Smallest date range a query can touch, for the backend pushdown.
    /// `None` (empty query) scans nothing anyway.
    fn query_date_bounds(
        &self,
        query_idx: &LazyFrame,
        marks: &[Mark],
    ) -> Result<Option<(NaiveDate, NaiveDate)>, DatasetError> {
        let mut lo: Option<NaiveDate> = None;
        let mut hi: Option<NaiveDate> = None;
        for mark in marks {
            let bounds = query_idx
                .clone()
                .select([
                    mark.start_time
                        .clone()
                        .cast(DataType::Date)
                        .min()
                        .alias("min_date"),
                    (mark.start_time.clone() + duration_lit(mark.duration))
                        .cast(DataType::Date)
                        .max()
                        .alias("max_date"),
                ])
                .collect()?;
            let min_days = bounds
                .column("min_date")?
                .as_materialized_series()
                .date()?
                .get(0);
            let max_days = bounds
                .column("max_date")?
                .as_materialized_series()
                .date()?
                .get(0);
            if let (Some(min_days), Some(max_days)) = (min_days, max_days) {
                let mark_lo = tickgrid_dataset::time::date_from_days(min_days);
                let mark_hi = tickgrid_dataset::time::date_from_days(max_days);
                lo = Some(lo.map_or(mark_lo, |d| d.min(mark_lo)));
                hi = Some(hi.map_or(mark_hi, |d| d.max(mark_hi)));
            }
        }
        Ok(lo.zip(hi))
    }

    fn in_range_db(&self, bounds: Option<(NaiveDate, NaiveDate)>) -> LazyFrame {
        let db = match bounds {
            Some((lo, hi)) => self
                .db
                .clone()
                .filter(col("date").is_between(lit(lo), lit(hi), ClosedInterval::Both)),
            None => self.db.clone(),
        };
        db.select([col("symbol"), col("tick_time"), col("fair")])
            .sort(["symbol", "tick_time"], SortMultipleOptions::default())
            .with_columns([col("tick_time").set_sorted_flag(IsSorted::Ascending)])
    }
}

/// Stacks span tables into `(row_id, symbol, query_time, is_end)` events,
/// sorted by `(symbol, query_time)` for the asof join.
fn long_events(spans: Vec<LazyFrame>, with_mark: bool) -> Result<LazyFrame, DatasetError> {
    let mut key_cols = vec![col("symbol"), col(ROW_ID)];
    if with_mark {
        key_cols.push(col(MARK));
    }
    let mut halves = Vec::with_capacity(spans.len() * 2);
    for span in spans {
        let mut start_cols = key_cols.clone();
        start_cols.push(col("start_time").alias("query_time"));
        start_cols.push(lit(false).alias("is_end"));
        halves.push(span.clone().select(start_cols));
        let mut end_cols = key_cols.clone();
        end_cols.push(col("end_time").alias("query_time"));
        end_cols.push(lit(true).alias("is_end"));
        halves.push(span.select(end_cols));
    }
    let events = concat(halves, UnionArgs::default())?
        .sort(["symbol", "query_time"], SortMultipleOptions::default())
        .with_columns([col("query_time").set_sorted_flag(IsSorted::Ascending)]);
    Ok(events)
}

/// Backward asof join by symbol, then the staleness policy: a tick with
/// `tick_time + tolerance < query_time` is too old and its fair is nulled.
/// `tick_time == query_time` is in tolerance.
fn asof_with_staleness(events: LazyFrame, db: LazyFrame, options: &QueryOptions) -> LazyFrame {
    let joined = events
        .join_builder()
        .with(db)
        .left_on([col("query_time")])
        .right_on([col("tick_time")])
        .how(JoinType::AsOf(AsOfOptions {
            strategy: AsofStrategy::Backward,
            left_by: Some(vec!["symbol".into()]),
            right_by: Some(vec!["symbol".into()]),
            ..Default::default()
        }))
        .finish();
    joined.with_columns([
        (col("query_time") - col("tick_time")).alias("tick_to_query_lag"),
        when((col("tick_time") + duration_lit(options.tick_lag_tolerance)).gt_eq(col("query_time")))
            .then(col("fair"))
            .otherwise(lit(NULL))
            .alias("fair"),
    ])
}

fn start_of(expr: Expr) -> Expr {
    expr.filter(col("is_end").eq(lit(false))).first()
}

fn end_of(expr: Expr) -> Expr {
    expr.filter(col("is_end")).first()
}

/// Per-row reduction over the two events. Division by a zero start fair maps
/// to NaN, never an error; a null fair on either side nulls the return.
fn reduction_exprs(options: &QueryOptions) -> Vec<Expr> {
    let start_fair = start_of(col("fair"));
    let end_fair = end_of(col("fair"));
    let mut aggs = Vec::new();
    if options.append_query_tick_times {
        aggs.push(start_of(col("query_time")).alias("start_query_time"));
        aggs.push(end_of(col("query_time")).alias("end_query_time"));
        aggs.push(start_of(col("tick_time")).alias("start_tick_time"));
        aggs.push(end_of(col("tick_time")).alias("end_tick_time"));
    }
    if options.append_lag {
        aggs.push(col("tick_to_query_lag").max().alias("max_tick_to_query_lag"));
    }
    if options.append_start_end_fairs {
        aggs.push(start_fair.clone().alias("start_fair"));
        aggs.push(end_fair.clone().alias("end_fair"));
    }
    aggs.push(
        when(start_fair.clone().eq(lit(0.0f64)))
            .then(lit(f64::NAN))
            .otherwise((end_fair - start_fair.clone()) / start_fair)
            .alias("return"),
    );
    aggs
}

/// Column names produced by [`reduction_exprs`], in output order.
fn metric_names(options: &QueryOptions) -> Vec<String> {
    let mut names = Vec::new();
    if options.append_query_tick_times {
        names.extend(
            ["start_query_time", "end_query_time", "start_tick_time", "end_tick_time"]
                .map(str::to_string),
        );
    }
    if options.append_lag {
        names.push("max_tick_to_query_lag".to_string());
    }
    if options.append_start_end_fairs {
        names.push("start_fair".to_string());
        names.push("end_fair".to_string());
    }
    names.push("return".to_string());
    names
}

/// The Float64 subset of the metrics: these carry NaN for absence. The lag
/// and time diagnostics are Duration/Datetime typed and stay null instead.
fn float_metric_names(options: &QueryOptions) -> Vec<String> {
    let mut names = Vec::new();
    if options.append_start_end_fairs {
        names.push("start_fair".to_string());
        names.push("end_fair".to_string());
    }
    names.push("return".to_string());
    names
}
