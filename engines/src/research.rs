use crate::metadata::{MetadataEngine, MetadataJoin};
use crate::returns::{BackendOptions, Mark, QueryOptions, ReturnsEngine};
use chrono::{NaiveDate, TimeDelta};
use polars::prelude::*;
use std::sync::Arc;
use tickgrid_dataset::dataset::ComputeSpec;
use tickgrid_dataset::error::DatasetError;
use tickgrid_dataset::view::{BackendDataset, DatasetView, ViewConfig, ViewSpec};
use tracing::debug;

/// The stock mark table: backward- and forward-looking horizons off the
/// index grid time. `mXX_to_now` marks end at the row's time, `now_to_pXX`
/// marks start there, and `p1m_to_pXX` marks skip the first minute.
pub fn default_mark_table() -> Vec<(String, Mark)> {
    let backward = |minutes: i64| {
        Mark::new(
            col("time") - tickgrid_dataset::time::duration_lit(TimeDelta::minutes(minutes)),
            TimeDelta::minutes(minutes),
        )
    };
    let forward = |offset_minutes: i64, minutes: i64| {
        Mark::new(
            col("time") + tickgrid_dataset::time::duration_lit(TimeDelta::minutes(offset_minutes)),
            TimeDelta::minutes(minutes),
        )
    };
    [
        ("m1m_to_now", backward(1)),
        ("m2m_to_now", backward(2)),
        ("m5m_to_now", backward(5)),
        ("m10m_to_now", backward(10)),
        ("m20m_to_now", backward(20)),
        ("m30m_to_now", backward(30)),
        ("m1h_to_now", backward(60)),
        ("m2h_to_now", backward(2 * 60)),
        ("m3h_to_now", backward(3 * 60)),
        ("m6h_to_now", backward(6 * 60)),
        ("m12h_to_now", backward(12 * 60)),
        ("m1d_to_now", backward(24 * 60)),
        ("now_to_p1m", forward(0, 1)),
        ("now_to_p2m", forward(0, 2)),
        ("now_to_p5m", forward(0, 5)),
        ("now_to_p10m", forward(0, 10)),
        ("p1m_to_p2m", forward(1, 1)),
        ("p1m_to_p3m", forward(1, 2)),
        ("p1m_to_p6m", forward(1, 5)),
        ("p1m_to_p11m", forward(1, 10)),
    ]
    .into_iter()
    .map(|(name, mark)| (name.to_string(), mark))
    .collect()
}

/// Research dataset: the outermost query path. Each partition is the index
/// grid sliced to the batch dates, widened with every mark horizon in one
/// backend pass, then joined point-in-time with the persisted metadata.
pub struct ResearchSpec {
    index: Arc<dyn BackendDataset>,
    backend: Arc<dyn BackendDataset>,
    metadata: Arc<MetadataEngine>,
    marks: Vec<(String, Mark)>,
    backend_options: BackendOptions,
    query_options: QueryOptions,
}

impl ResearchSpec {
    /// `index` supplies the query grid and the universe; `backend` supplies
    /// the ticks returns are marked against; `metadata` must be computed
    /// before research partitions are.
    pub fn new(
        index: Arc<dyn BackendDataset>,
        backend: Arc<dyn BackendDataset>,
        metadata: Arc<MetadataEngine>,
    ) -> Self {
        Self {
            index,
            backend,
            metadata,
            marks: default_mark_table(),
            backend_options: BackendOptions::default(),
            query_options: QueryOptions {
                tick_lag_tolerance: TimeDelta::minutes(10),
                append_lag: false,
                ..QueryOptions::default()
            },
        }
    }

    pub fn with_marks(mut self, marks: Vec<(String, Mark)>) -> Self {
        self.marks = marks;
        self
    }

    pub fn with_backend_options(mut self, options: BackendOptions) -> Self {
        self.backend_options = options;
        self
    }

    pub fn with_query_options(mut self, options: QueryOptions) -> Self {
        self.query_options = options;
        self
    }

    pub fn into_dataset(self, view: ViewConfig) -> Result<ResearchDataset, DatasetError> {
        DatasetView::new(self, view)
    }
}

impl ViewSpec for ResearchSpec {
    fn universe(&self) -> Result<DataFrame, DatasetError> {
        self.index.universe()
    }
}

impl ComputeSpec for ResearchSpec {
    fn compute_partitions(&self, dates: &[NaiveDate]) -> Result<LazyFrame, DatasetError> {
        let start = *dates.iter().min().ok_or_else(|| {
            DatasetError::InvalidArgument("compute_partitions needs at least one date".to_string())
        })?;
        let end = *dates.iter().max().expect("non-empty dates");
        debug!("computing research partitions for {start} to {end}");

        let query = self
            .index
            .lazyframe(false)?
            .filter(col("date").is_between(lit(start), lit(end), ClosedInterval::Both));
        let engine = ReturnsEngine::new(
            self.backend.lazyframe(false)?,
            self.backend.symbols().clone(),
            self.backend_options.clone(),
        )?;
        let with_returns = engine.query_batch(query, &self.marks, &self.query_options)?;
        self.metadata.append_metadata(with_returns, "time", "symbol")
    }
}

/// A research dataset: `DatasetView` over a [`ResearchSpec`].
pub type ResearchDataset = DatasetView<ResearchSpec>;
