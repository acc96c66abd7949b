//! Batch dispatch.
//!
//! - [`BatchProcessor`] splits a finished collection into fixed-size batches
//!   and runs them sequentially, on tokio tasks or on OS threads.
//! - [`StreamingBatchProcessor`] accumulates items as they arrive and
//!   dispatches a batch whenever it fills up, on `flush`, or when an
//!   auto-flush timer finds it stale.
//! - [`AdaptiveBatchProcessor`] is a streaming processor whose batch size
//!   follows the observed batch duration toward a target.
//!
//! A failing batch is recorded in its own [`BatchResult`] and never affects
//! its siblings.

pub mod adaptive;
mod processor;
mod streaming;

pub use adaptive::{AdaptiveBatchProcessor, AdaptiveState, ProcessorState};
pub use processor::BatchProcessor;
pub use streaming::{AutoFlushHandle, StreamingBatchProcessor};

use crate::error::ProcessingError;
use crate::processor::{BatchFn, ProcessResult};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of one dispatched batch
#[derive(Debug, Clone)]
pub struct BatchResult<T, R> {
    /// Monotonic per processor
    pub batch_id: u64,
    pub items: Vec<T>,
    /// One result per item, or the error that failed the whole batch
    pub results: ProcessResult<Vec<R>>,
    pub start_time: Instant,
    pub end_time: Instant,
}

impl<T, R> BatchResult<T, R> {
    pub fn duration(&self) -> Duration {
        self.end_time.saturating_duration_since(self.start_time)
    }

    pub fn success(&self) -> bool {
        self.results.is_ok()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Aggregate counters over every batch a processor has dispatched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStatistics {
    pub total_batches: u64,
    pub successful_batches: u64,
    pub failed_batches: u64,
    pub total_items: u64,
    /// Sum of batch durations
    pub total_duration: Duration,
    /// `total_items / total_duration`
    pub items_per_second: f64,
    pub average_batch_size: f64,
}

impl BatchStatistics {
    pub(crate) fn record<T, R>(&mut self, batch: &BatchResult<T, R>) {
        self.total_batches += 1;
        if batch.success() {
            self.successful_batches += 1;
        } else {
            self.failed_batches += 1;
        }
        self.total_items += batch.len() as u64;
        self.total_duration += batch.duration();

        let secs = self.total_duration.as_secs_f64();
        self.items_per_second = if secs > 0.0 {
            self.total_items as f64 / secs
        } else {
            0.0
        };
        self.average_batch_size = self.total_items as f64 / self.total_batches as f64;
    }
}

/// Split `items` into consecutive chunks of `batch_size`; the last may be
/// shorter.
pub(crate) fn chunk<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let batch_size = batch_size.max(1);
    let mut iter = items.into_iter().peekable();
    std::iter::from_fn(move || {
        iter.peek()?;
        Some(iter.by_ref().take(batch_size).collect())
    })
    .collect()
}

fn check_cardinality<R>(results: Vec<R>, expected: usize) -> ProcessResult<Vec<R>> {
    if results.len() == expected {
        Ok(results)
    } else {
        Err(ProcessingError::Failed(format!(
            "batch function returned {} results for {} items",
            results.len(),
            expected
        )))
    }
}

fn log_outcome<T, R>(batch: &BatchResult<T, R>) {
    match &batch.results {
        Ok(_) => debug!(
            batch_id = batch.batch_id,
            size = batch.len(),
            duration_ms = batch.duration().as_millis() as u64,
            "batch completed"
        ),
        Err(err) => warn!(
            batch_id = batch.batch_id,
            size = batch.len(),
            error = %err,
            "batch failed"
        ),
    }
}

/// Run one batch on the current task.
pub(crate) async fn execute_batch<T, R>(
    batch_id: u64,
    items: Vec<T>,
    batch_fn: &BatchFn<T, R>,
) -> BatchResult<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    let expected = items.len();
    let start_time = Instant::now();
    let results = batch_fn
        .invoke(items.clone())
        .await
        .and_then(|results| check_cardinality(results, expected));
    let batch = BatchResult {
        batch_id,
        items,
        results,
        start_time,
        end_time: Instant::now(),
    };
    log_outcome(&batch);
    batch
}

/// Run one batch on a plain OS thread.
pub(crate) fn execute_batch_blocking<T, R>(
    batch_id: u64,
    items: Vec<T>,
    batch_fn: &BatchFn<T, R>,
    handle: &tokio::runtime::Handle,
) -> BatchResult<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    let expected = items.len();
    let start_time = Instant::now();
    let results = batch_fn
        .invoke_blocking(items.clone(), handle)
        .and_then(|results| check_cardinality(results, expected));
    let batch = BatchResult {
        batch_id,
        items,
        results,
        start_time,
        end_time: Instant::now(),
    };
    log_outcome(&batch);
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Processor;

    #[test]
    fn test_chunk_sizes() {
        let chunks = chunk((0..10).collect(), 4);
        let sizes: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(chunks[2], vec![8, 9]);
        assert!(chunk(Vec::<u8>::new(), 3).is_empty());
    }

    #[tokio::test]
    async fn test_short_result_vector_fails_batch() {
        let lossy: BatchFn<u32, u32> = Processor::infallible(|xs: Vec<u32>| {
            xs.into_iter().skip(1).collect()
        });
        let batch = execute_batch(0, vec![1, 2, 3], &lossy).await;
        assert!(!batch.success());
        assert_eq!(batch.items, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_accumulate() {
        let slow: BatchFn<u32, u32> = Processor::from_async(|xs: Vec<u32>| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(xs)
        });
        let mut stats = BatchStatistics::default();
        stats.record(&execute_batch(0, vec![1, 2, 3, 4], &slow).await);
        stats.record(&execute_batch(1, vec![5, 6], &slow).await);

        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.successful_batches, 2);
        assert_eq!(stats.total_items, 6);
        assert_eq!(stats.total_duration, Duration::from_millis(200));
        assert!((stats.items_per_second - 30.0).abs() < 1e-9);
        assert!((stats.average_batch_size - 3.0).abs() < 1e-9);
    }
}
