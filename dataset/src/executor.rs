use anyhow::{anyhow, Result};
use indicatif::ProgressBar;

/// Splits `items` into chunks of at most `chunk_size`, preserving order.
pub fn chunk_list<T: Clone>(items: &[T], chunk_size: usize) -> Vec<Vec<T>> {
    items
        .chunks(chunk_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Fixed pool of worker threads with ordered result collection.
///
/// Tasks are drawn from a shared queue; results are always returned in the
/// order of the inputs regardless of completion order. There is no
/// cancellation: a failing task never stops the others, the queue drains
/// fully and errors are reported once everything settled.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    num_workers: usize,
    progress: bool,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl ParallelExecutor {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            progress: false,
        }
    }

    /// Enables a per-task progress counter.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Applies `task` to every argument in parallel and returns results in
    /// input order. The first captured error is returned after the queue has
    /// drained.
    pub fn map<T, R, F>(&self, args: &[T], task: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync,
    {
        let mut out = Vec::with_capacity(args.len());
        let mut first_error = None;
        for result in self.run(args, &task) {
            match result {
                Ok(value) => out.push(value),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Like [`map`](Self::map), but failed tasks are substituted through
    /// `on_error(error, arg, index)` instead of failing the whole call.
    pub fn map_with_fallback<T, R, F, G>(&self, args: &[T], task: F, on_error: G) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync,
        G: Fn(anyhow::Error, &T, usize) -> R,
    {
        self.run(args, &task)
            .into_iter()
            .enumerate()
            .map(|(index, result)| result.unwrap_or_else(|e| on_error(e, &args[index], index)))
            .collect()
    }

    /// Splits `args` into chunks of `chunk_size`, runs one worker task per
    /// chunk and concatenates the per-item results preserving input order.
    pub fn chunk_apply<T, R, F>(&self, args: &[T], chunk_size: usize, task: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync,
    {
        let chunks: Vec<&[T]> = args.chunks(chunk_size.max(1)).collect();
        let nested = self.map(&chunks, |chunk: &&[T]| {
            chunk.iter().map(&task).collect::<Result<Vec<R>>>()
        })?;
        Ok(nested.into_iter().flatten().collect())
    }

    fn run<T, R, F>(&self, args: &[T], task: &F) -> Vec<Result<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync,
    {
        let total = args.len();
        if total == 0 {
            return vec![];
        }
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<usize>();
        for index in 0..total {
            let _ = job_tx.send(index);
        }
        drop(job_tx);

        let (result_tx, result_rx) = crossbeam_channel::unbounded::<(usize, Result<R>)>();
        let bar = if self.progress {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        let workers = self.num_workers.min(total);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let bar = bar.clone();
                scope.spawn(move || {
                    while let Ok(index) = job_rx.recv() {
                        let result = task(&args[index]);
                        bar.inc(1);
                        if result_tx.send((index, result)).is_err() {
                            return;
                        }
                    }
                });
            }
            drop(result_tx);
            drop(job_rx);
        });
        bar.finish_and_clear();

        let mut slots: Vec<Option<Result<R>>> = (0..total).map(|_| None).collect();
        for (index, result) in result_rx.try_iter() {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(anyhow!("worker dropped a task result"))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_list_preserves_order_and_remainder() {
        let chunks = chunk_list(&[1, 2, 3, 4, 5], 2);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }
}
