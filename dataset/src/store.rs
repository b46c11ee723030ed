use crate::error::DatasetError;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the persistent validation cache inside a dataset root.
pub const VALIDATION_FILE: &str = "validated_partitions.json";

/// File name used for partition data written by this store.
const PARTITION_FILE: &str = "data.parquet";

#[derive(Serialize, Deserialize, Default)]
struct ValidationCacheFile {
    valid_partitions: Vec<NaiveDate>,
}

/// On-disk hive layout for one dataset root: `{root}/date=YYYY-MM-DD/` holds
/// the parquet files of a partition, `{root}/validated_partitions.json` holds
/// the persistent validation cache.
///
/// The `date` column is stored inside the partition files themselves; the
/// directory name is layout only, so scans never depend on hive column
/// synthesis.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
    parquet_glob: String,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>, parquet_glob: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            parquet_glob: parquet_glob.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn parquet_glob(&self) -> &str {
        &self.parquet_glob
    }

    /// Directory of one partition: `{root}/date=YYYY-MM-DD`.
    pub fn partition_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!("date={date}"))
    }

    fn scan_args() -> ScanArgsParquet {
        let mut args = ScanArgsParquet::default();
        args.hive_options.enabled = Some(false);
        args
    }

    /// Lazy scan of a single partition. Errors when the partition directory
    /// is missing or no file matches the glob.
    pub fn scan_partition(&self, date: NaiveDate) -> Result<LazyFrame, DatasetError> {
        let dir = self.partition_dir(date);
        if !dir.is_dir() {
            return Err(DatasetError::ReadError {
                path: dir,
                source: PolarsError::NoData("partition directory does not exist".into()),
            });
        }
        let pattern = dir.join(&self.parquet_glob);
        LazyFrame::scan_parquet(&pattern, Self::scan_args()).map_err(|source| {
            DatasetError::ReadError {
                path: pattern,
                source,
            }
        })
    }

    /// Lazy scan of every partition: `{root}/date=*/**/{glob}`.
    pub fn scan_all(&self) -> Result<LazyFrame, DatasetError> {
        let pattern = self.root.join("date=*").join("**").join(&self.parquet_glob);
        LazyFrame::scan_parquet(&pattern, Self::scan_args()).map_err(|source| {
            DatasetError::ReadError {
                path: pattern,
                source,
            }
        })
    }

    /// Writes one parquet file per requested date, resolving the batch frame
    /// lazily for each date so worker memory stays bounded by one partition.
    ///
    /// Rows are sorted by `time` then `symbol` (when present) inside each
    /// partition; cross-partition ordering is not defined. Each file is
    /// written to a temp name and renamed into place. Dates without rows
    /// produce no directory and stay invalid until data exists.
    pub fn write_partition_batch(
        &self,
        frame: LazyFrame,
        dates: &[NaiveDate],
    ) -> Result<(), DatasetError> {
        let mut frame = frame;
        let schema = frame.collect_schema()?;
        if schema.get("date").is_none() {
            return Err(DatasetError::SchemaMismatch {
                expected: "a `date` column for partitioning".to_string(),
                actual: format!("{:?}", schema.iter_names().collect::<Vec<_>>()),
            });
        }
        let mut sort_keys: Vec<PlSmallStr> = Vec::new();
        if schema.get("time").is_some() {
            sort_keys.push("time".into());
            if schema.get("symbol").is_some() {
                sort_keys.push("symbol".into());
            }
        }

        for date in dates {
            let mut partition = frame.clone().filter(col("date").eq(lit(*date)));
            if !sort_keys.is_empty() {
                partition = partition.sort(sort_keys.clone(), SortMultipleOptions::default());
            }
            let mut df = partition.collect()?;
            if df.height() == 0 {
                debug!("no rows for partition {date}, skipping");
                continue;
            }
            let dir = self.partition_dir(*date);
            fs::create_dir_all(&dir)?;
            let path = dir.join(PARTITION_FILE);
            let tmp_path = dir.join(format!("{PARTITION_FILE}.tmp"));
            let file = fs::File::create(&tmp_path)?;
            ParquetWriter::new(file).finish(&mut df)?;
            fs::rename(&tmp_path, &path).map_err(|e| {
                let _ = fs::remove_file(&tmp_path);
                DatasetError::Io(e)
            })?;
        }
        Ok(())
    }

    /// Path of the validation cache file.
    pub fn validation_file(&self) -> PathBuf {
        self.root.join(VALIDATION_FILE)
    }

    /// Loads the persisted validation cache. A missing or unreadable file is
    /// an empty set: the in-memory cache stays authoritative for the session.
    pub fn load_validation_json(&self) -> BTreeSet<NaiveDate> {
        let path = self.validation_file();
        if !path.is_file() {
            debug!("no validation cache file at {}", path.display());
            return BTreeSet::new();
        }
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("could not read validation cache {}: {e}", path.display());
                return BTreeSet::new();
            }
        };
        match serde_json::from_str::<ValidationCacheFile>(&content) {
            Ok(cache) => cache.valid_partitions.into_iter().collect(),
            Err(e) => {
                warn!("could not parse validation cache {}: {e}", path.display());
                BTreeSet::new()
            }
        }
    }

    /// Persists the validation cache atomically (temp file + rename), dates
    /// sorted ascending.
    pub fn save_validation_json(&self, valid: &BTreeSet<NaiveDate>) -> Result<(), DatasetError> {
        fs::create_dir_all(&self.root)?;
        let cache = ValidationCacheFile {
            valid_partitions: valid.iter().copied().collect(),
        };
        let path = self.validation_file();
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(&cache)?)?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            DatasetError::Io(e)
        })?;
        Ok(())
    }

    /// Deletes the validation cache file if present.
    pub fn delete_validation_json(&self) -> Result<(), DatasetError> {
        let path = self.validation_file();
        if path.is_file() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}
