use crate::error::DatasetError;
use crate::executor::ParallelExecutor;
use crate::store::PartitionStore;
use crate::universe::{check_universe_schema, unique_dates, unique_symbols};
use chrono::NaiveDate;
use polars::prelude::*;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Frozen symbol universe: the closed, lexicographically sorted set of
/// symbols a dataset intends to cover.
///
/// Symbol columns stay `String` typed; closedness is enforced by the engines,
/// which drop rows outside the domain before joining and reattach them as
/// NaN on the final left join.
#[derive(Debug, Clone)]
pub struct SymbolDomain {
    symbols: Arc<Vec<String>>,
}

impl SymbolDomain {
    pub fn new(mut symbols: Vec<String>) -> Self {
        symbols.sort();
        symbols.dedup();
        Self {
            symbols: Arc::new(symbols),
        }
    }

    /// Domain of the distinct symbols of a universe table.
    pub fn from_universe(universe: &DataFrame) -> Result<Self, DatasetError> {
        Ok(Self::new(unique_symbols(universe)?))
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.binary_search_by(|s| s.as_str().cmp(symbol)).is_ok()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// One-column `symbol` frame for semi/anti membership joins.
    pub fn frame(&self) -> Result<LazyFrame, DatasetError> {
        let df = df!("symbol" => self.symbols.as_slice())?;
        Ok(df.lazy())
    }

    /// Conforms a symbol column to the domain dtype. Idempotent; applied to
    /// every frame a view hands out.
    pub fn conform(&self, frame: LazyFrame) -> LazyFrame {
        frame.with_columns([col("symbol").cast(DataType::String)])
    }
}

/// Behavior hooks of a date-partitioned view.
///
/// Implementations hold owned configuration only (paths, intervals,
/// expressions): workers call these hooks concurrently and every call builds
/// its lazy frames fresh, so no worker ever observes mutable dataset state.
pub trait ViewSpec: Send + Sync {
    /// The universe table describing what data should exist. Must carry
    /// `date: Date` and `symbol: String` columns; called once at view
    /// construction.
    fn universe(&self) -> Result<DataFrame, DatasetError>;

    /// Validity predicate for one partition. The default scans the
    /// partition's parquet files and forces one row; any failure is invalid.
    fn valid_partition(&self, store: &PartitionStore, date: NaiveDate) -> bool {
        let scan = match store.scan_partition(date) {
            Ok(scan) => scan,
            Err(e) => {
                debug!("partition {date} failed validation: {e}");
                return false;
            }
        };
        match scan.slice(0, 1).collect() {
            Ok(_) => true,
            Err(e) => {
                debug!("partition {date} failed validation: {e}");
                false
            }
        }
    }

    /// Post-processing applied to every frame returned to users. The default
    /// conforms the `symbol` column to the frozen universe domain when one is
    /// present; overrides should keep the operation idempotent.
    fn postprocess(
        &self,
        domain: &SymbolDomain,
        frame: LazyFrame,
    ) -> Result<LazyFrame, DatasetError> {
        let mut frame = frame;
        let schema = frame.collect_schema()?;
        if schema.get("symbol").is_some() {
            Ok(domain.conform(frame))
        } else {
            Ok(frame)
        }
    }
}

/// View spec over an existing hive store: the universe comes from the
/// store's cached `universe.parquet`, and the validity predicate can be
/// tightened to require a specific column set.
pub struct ParquetViewSpec {
    root: PathBuf,
    expected_columns: Option<Vec<String>>,
}

impl ParquetViewSpec {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            expected_columns: None,
        }
    }

    pub fn with_expected_columns(mut self, columns: Vec<String>) -> Self {
        self.expected_columns = Some(columns);
        self
    }
}

impl ViewSpec for ParquetViewSpec {
    fn universe(&self) -> Result<DataFrame, DatasetError> {
        crate::universe::read_universe(&self.root)
    }

    fn valid_partition(&self, store: &PartitionStore, date: NaiveDate) -> bool {
        let mut scan = match store.scan_partition(date) {
            Ok(scan) => scan,
            Err(e) => {
                debug!("partition {date} failed validation: {e}");
                return false;
            }
        };
        if let Some(expected) = &self.expected_columns {
            let schema = match scan.collect_schema() {
                Ok(schema) => schema,
                Err(e) => {
                    debug!("partition {date} failed validation: {e}");
                    return false;
                }
            };
            if let Some(missing) = expected
                .iter()
                .find(|column| schema.get(column.as_str()).is_none())
            {
                debug!("partition {date} is missing expected column {missing}");
                return false;
            }
        }
        scan.slice(0, 1).collect().is_ok()
    }
}

/// Read-only access to a dataset through its validation state machine.
pub trait BackendDataset: Send + Sync {
    fn universe(&self) -> Result<DataFrame, DatasetError>;
    fn lazyframe(&self, validate: bool) -> Result<LazyFrame, DatasetError>;
    fn symbols(&self) -> &SymbolDomain;
}

/// Construction options of a [`DatasetView`].
#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub root: PathBuf,
    pub num_workers: usize,
    pub parquet_glob: String,
    pub progress: bool,
}

impl ViewConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            num_workers: num_cpus::get(),
            parquet_glob: "*.parquet".to_string(),
            progress: false,
        }
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_parquet_glob(mut self, glob: impl Into<String>) -> Self {
        self.parquet_glob = glob.into();
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}

/// Read-only partitioned view over a hive store.
///
/// Partitions are derived from the spec's universe at construction; their
/// validity is checked lazily, in parallel, and cached both in memory and in
/// the store's `validated_partitions.json`. The in-memory set is the
/// authority for the session.
///
/// Cache-mutating operations take `&mut self`: validation and computation
/// must not run concurrently on one dataset, and the borrow checker enforces
/// exactly that.
pub struct DatasetView<S> {
    spec: S,
    store: PartitionStore,
    executor: ParallelExecutor,
    partitions: Vec<NaiveDate>,
    symbols: SymbolDomain,
    valid: BTreeSet<NaiveDate>,
}

impl<S: ViewSpec> DatasetView<S> {
    pub fn new(spec: S, config: ViewConfig) -> Result<Self, DatasetError> {
        let store = PartitionStore::new(&config.root, &config.parquet_glob);
        let universe = spec.universe()?;
        check_universe_schema(&universe)?;
        let partitions = unique_dates(&universe)?;
        let symbols = SymbolDomain::from_universe(&universe)?;
        let valid = store.load_validation_json();
        if !valid.is_empty() {
            debug!(
                "loaded {} validated partitions from {}",
                valid.len(),
                store.validation_file().display()
            );
        }
        Ok(Self {
            spec,
            store,
            executor: ParallelExecutor::new(config.num_workers).with_progress(config.progress),
            partitions,
            symbols,
            valid,
        })
    }

    pub fn spec(&self) -> &S {
        &self.spec
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub fn executor(&self) -> &ParallelExecutor {
        &self.executor
    }

    /// All partition dates, ascending.
    pub fn partitions(&self) -> &[NaiveDate] {
        &self.partitions
    }

    /// The frozen symbol universe.
    pub fn symbols(&self) -> &SymbolDomain {
        &self.symbols
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn num_validated(&self) -> usize {
        self.valid.len()
    }

    pub fn valid_partitions(&self) -> &BTreeSet<NaiveDate> {
        &self.valid
    }

    /// Single point of validation-cache mutation. Persisting failures are
    /// logged and swallowed: the in-memory set stays authoritative.
    pub fn update_validations(
        &mut self,
        new: &[NaiveDate],
        outdated: &[NaiveDate],
        memory: bool,
        file: bool,
    ) {
        if memory {
            self.valid.extend(new.iter().copied());
            for date in outdated {
                self.valid.remove(date);
            }
        }
        if file {
            if let Err(e) = self.store.save_validation_json(&self.valid) {
                warn!("could not save validation cache: {e}");
            }
        }
    }

    /// Checks one partition, preferring the cache unless `recompute`.
    /// The result is cached in memory and persisted.
    pub fn valid_partition(&mut self, date: NaiveDate, recompute: bool) -> bool {
        if !recompute && self.valid.contains(&date) {
            return true;
        }
        let is_valid = self.spec.valid_partition(&self.store, date);
        if is_valid {
            self.update_validations(&[date], &[], true, true);
        } else {
            self.update_validations(&[], &[date], true, true);
        }
        is_valid
    }

    /// Fails with [`DatasetError::InvalidPartition`] when the partition does
    /// not pass the validity predicate.
    pub fn validate_partition(&mut self, date: NaiveDate) -> Result<(), DatasetError> {
        if self.valid_partition(date, false) {
            Ok(())
        } else {
            Err(DatasetError::InvalidPartition(date))
        }
    }

    /// Finds invalid partitions with a parallel batch check.
    ///
    /// With `recompute = false` only uncached dates are checked and every
    /// known-invalid date is returned; with `recompute = true` everything is
    /// re-checked and only the newly found invalid dates are returned.
    pub fn invalid_partitions(
        &mut self,
        recompute: bool,
    ) -> Result<BTreeSet<NaiveDate>, DatasetError> {
        let to_validate: Vec<NaiveDate> = if recompute {
            self.partitions.clone()
        } else {
            self.partitions
                .iter()
                .copied()
                .filter(|date| !self.valid.contains(date))
                .collect()
        };
        if to_validate.is_empty() {
            debug!("all partitions already validated");
            return Ok(BTreeSet::new());
        }
        info!(
            "validating {} partitions with {} workers",
            to_validate.len(),
            self.executor.num_workers()
        );
        let spec = &self.spec;
        let store = &self.store;
        let results = self.executor.map_with_fallback(
            &to_validate,
            |date| Ok(spec.valid_partition(store, *date)),
            |e, date, _| {
                error!("exception validating {date}: {e:#}");
                false
            },
        );
        let mut newly_valid = Vec::new();
        let mut newly_invalid = Vec::new();
        for (date, is_valid) in to_validate.iter().zip(results) {
            if is_valid {
                newly_valid.push(*date);
            } else {
                newly_invalid.push(*date);
            }
        }
        self.update_validations(&newly_valid, &newly_invalid, true, true);
        if recompute {
            Ok(newly_invalid.into_iter().collect())
        } else {
            Ok(self
                .partitions
                .iter()
                .copied()
                .filter(|date| !self.valid.contains(date))
                .collect())
        }
    }

    /// Validates every partition; fails with
    /// [`DatasetError::ValidationFailure`] listing the invalid dates.
    pub fn validate(&mut self, recompute: bool) -> Result<(), DatasetError> {
        let invalid = self.invalid_partitions(recompute)?;
        if invalid.is_empty() {
            Ok(())
        } else {
            Err(DatasetError::ValidationFailure(
                invalid.into_iter().collect(),
            ))
        }
    }

    /// Lazy frame over the requested partitions (or all of them), validating
    /// first and applying post-processing.
    pub fn get(&mut self, dates: Option<&[NaiveDate]>) -> Result<LazyFrame, DatasetError> {
        match dates {
            None => {
                self.validate(false)?;
                let frame = self.store.scan_all()?;
                self.spec.postprocess(&self.symbols, frame)
            }
            Some(dates) => {
                for date in dates {
                    self.validate_partition(*date)?;
                }
                let scans = dates
                    .iter()
                    .map(|date| self.store.scan_partition(*date))
                    .collect::<Result<Vec<_>, _>>()?;
                let frame = concat(scans, UnionArgs::default())?;
                self.spec.postprocess(&self.symbols, frame)
            }
        }
    }

    /// Lazy frame over the whole dataset, without touching the validation
    /// cache. With `validate`, one row is materialized as a sanity check.
    pub fn lazyframe(&self, validate: bool) -> Result<LazyFrame, DatasetError> {
        let frame = self.store.scan_all()?;
        let frame = self.spec.postprocess(&self.symbols, frame)?;
        if validate {
            frame
                .clone()
                .slice(0, 1)
                .collect()
                .map_err(|source| DatasetError::ReadError {
                    path: self.store.root().to_path_buf(),
                    source,
                })?;
        }
        Ok(frame)
    }

    /// Clears the validation cache in memory and/or deletes the cache file.
    pub fn clear_validation(&mut self, memory: bool, file: bool) {
        if memory {
            self.valid.clear();
        }
        if file {
            if let Err(e) = self.store.delete_validation_json() {
                error!("could not delete validation cache file: {e}");
            }
        }
    }
}

impl<S: ViewSpec> BackendDataset for DatasetView<S> {
    fn universe(&self) -> Result<DataFrame, DatasetError> {
        self.spec.universe()
    }

    fn lazyframe(&self, validate: bool) -> Result<LazyFrame, DatasetError> {
        DatasetView::lazyframe(self, validate)
    }

    fn symbols(&self) -> &SymbolDomain {
        &self.symbols
    }
}
