use crate::error::DatasetError;
use crate::executor::chunk_list;
use crate::view::{DatasetView, ViewSpec};
use anyhow::Context;
use chrono::NaiveDate;
use polars::prelude::*;
use tracing::{error, info};

/// A view spec that can (re)build its own partitions.
pub trait ComputeSpec: ViewSpec {
    /// Produces a frame covering the requested dates, `date` column included.
    /// Rows outside the batch are harmless but wasted. Called from worker
    /// threads; the result is post-processed and streamed to disk partitioned
    /// by date.
    fn compute_partitions(&self, dates: &[NaiveDate]) -> Result<LazyFrame, DatasetError>;
}

impl<S: ComputeSpec> DatasetView<S> {
    /// Computes missing partitions (or everything with `recompute`) in
    /// parallel batches of `days_per_batch` dates.
    ///
    /// Every date of a successfully written batch is marked valid in memory
    /// and persisted; successful batches persist even when other batches
    /// fail. Fails with [`DatasetError::ComputationFailure`] listing every
    /// date of every failed batch. No retry: rerunning with
    /// `recompute = false` resumes from the cache.
    pub fn compute(&mut self, recompute: bool, days_per_batch: usize) -> Result<(), DatasetError> {
        let to_compute: Vec<NaiveDate> = if recompute {
            self.partitions().to_vec()
        } else {
            self.partitions()
                .iter()
                .copied()
                .filter(|date| !self.valid_partitions().contains(date))
                .collect()
        };
        if to_compute.is_empty() {
            return Ok(());
        }
        let batches = chunk_list(&to_compute, days_per_batch);
        info!(
            "computing {} partitions in {} batches ({days_per_batch} days/batch) with {} workers",
            to_compute.len(),
            batches.len(),
            self.executor().num_workers()
        );

        let spec = self.spec();
        let store = self.store();
        let symbols = self.symbols();
        let batch_ok = self.executor().map_with_fallback(
            &batches,
            |batch| {
                let frame = spec
                    .compute_partitions(batch)
                    .with_context(|| "compute_partitions")?;
                let frame = spec.postprocess(symbols, frame)?;
                store
                    .write_partition_batch(frame, batch)
                    .with_context(|| "write_partition_batch")?;
                Ok(true)
            },
            |e, batch, _| {
                error!(
                    "computation failed for batch {} to {}: {e:#}",
                    batch.first().copied().unwrap_or_default(),
                    batch.last().copied().unwrap_or_default()
                );
                false
            },
        );

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for (batch, ok) in batches.iter().zip(batch_ok) {
            if ok {
                successful.extend_from_slice(batch);
            } else {
                failed.extend_from_slice(batch);
            }
        }
        info!(
            "computation complete: {}/{} partitions successful",
            successful.len(),
            to_compute.len()
        );
        self.update_validations(&successful, &failed, true, true);
        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            Err(DatasetError::ComputationFailure(failed))
        }
    }
}
