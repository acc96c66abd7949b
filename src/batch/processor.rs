use super::{chunk, execute_batch, execute_batch_blocking, BatchResult, BatchStatistics};
use crate::config::{BatchConfig, WorkerKind};
use crate::error::{PipelineError, Result};
use crate::processor::BatchFn;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

/// Splits a collection into batches and dispatches them.
#[derive(Debug)]
pub struct BatchProcessor {
    config: BatchConfig,
    next_batch_id: AtomicU64,
    stats: Mutex<BatchStatistics>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            next_batch_id: AtomicU64::new(0),
            stats: Mutex::new(BatchStatistics::default()),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Process `items` in batches of `batch_size`.
    ///
    /// With `parallel` unset batches run one after another on the calling
    /// task. Otherwise at most `max_concurrent_batches` run at once, on tokio
    /// tasks or OS threads depending on the configured [`WorkerKind`].
    /// Results come back ordered by `batch_id`; together they hold every
    /// input item exactly once.
    pub async fn process<T, R>(
        &self,
        items: Vec<T>,
        batch_fn: &BatchFn<T, R>,
        parallel: bool,
    ) -> Result<Vec<BatchResult<T, R>>>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
    {
        let batches: Vec<(u64, Vec<T>)> = chunk(items, self.config.batch_size)
            .into_iter()
            .map(|items| (self.next_batch_id.fetch_add(1, Ordering::Relaxed), items))
            .collect();
        debug!(
            batches = batches.len(),
            parallel,
            worker_kind = ?self.config.worker_kind,
            "processing batches"
        );

        let mut results = if !parallel || batches.len() <= 1 {
            let mut results = Vec::with_capacity(batches.len());
            for (batch_id, items) in batches {
                results.push(execute_batch(batch_id, items, batch_fn).await);
            }
            results
        } else {
            match self.config.worker_kind {
                WorkerKind::Tasks => self.run_on_tasks(batches, batch_fn).await?,
                WorkerKind::Threads => self.run_on_threads(batches, batch_fn).await?,
            }
        };
        results.sort_by_key(|r| r.batch_id);

        let mut stats = self.stats.lock();
        for result in &results {
            stats.record(result);
        }
        Ok(results)
    }

    async fn run_on_tasks<T, R>(
        &self,
        batches: Vec<(u64, Vec<T>)>,
        batch_fn: &BatchFn<T, R>,
    ) -> Result<Vec<BatchResult<T, R>>>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_batches));
        let mut tasks = JoinSet::new();
        for (batch_id, items) in batches {
            let permits = Arc::clone(&permits);
            let batch_fn = batch_fn.clone();
            tasks.spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                execute_batch(batch_id, items, &batch_fn).await
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.map_err(|e| PipelineError::TaskJoin(e.to_string()))?);
        }
        Ok(results)
    }

    async fn run_on_threads<T, R>(
        &self,
        batches: Vec<(u64, Vec<T>)>,
        batch_fn: &BatchFn<T, R>,
    ) -> Result<Vec<BatchResult<T, R>>>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
    {
        let handle = tokio::runtime::Handle::current();
        let batch_fn = batch_fn.clone();
        let workers = self.config.max_concurrent_batches.min(batches.len());

        tokio::task::spawn_blocking(move || thread_pool(batches, &batch_fn, workers, &handle))
            .await
            .map_err(|e| PipelineError::TaskJoin(e.to_string()))?
    }

    pub fn statistics(&self) -> BatchStatistics {
        self.stats.lock().clone()
    }
}

/// Scoped worker threads pulling batches off a shared channel.
fn thread_pool<T, R>(
    batches: Vec<(u64, Vec<T>)>,
    batch_fn: &BatchFn<T, R>,
    workers: usize,
    handle: &tokio::runtime::Handle,
) -> Result<Vec<BatchResult<T, R>>>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    let total = batches.len();
    let (tx, rx) = crossbeam::channel::unbounded();
    for batch in batches {
        if tx.send(batch).is_err() {
            break;
        }
    }
    drop(tx);

    let collected = Mutex::new(Vec::with_capacity(total));
    crossbeam::thread::scope(|scope| {
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let collected = &collected;
            scope.spawn(move |_| {
                debug!(worker, "batch worker started");
                for (batch_id, items) in rx.iter() {
                    let result = execute_batch_blocking(batch_id, items, batch_fn, handle);
                    collected.lock().push(result);
                }
            });
        }
    })
    .map_err(|_| PipelineError::TaskJoin("batch worker thread panicked".to_string()))?;

    Ok(collected.into_inner())
}
