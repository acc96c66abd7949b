use super::{AutoFlushHandle, BatchResult, BatchStatistics, StreamingBatchProcessor};
use crate::config::{AdaptiveConfig, BatchConfig};
use crate::error::Result;
use crate::processor::BatchFn;
use std::time::Duration;

/// Lifecycle of a streaming batch processor.
///
/// `Accumulating → Dispatching → AdjustSize → Accumulating`. `AdjustSize`
/// only exists while a completed batch's duration is being folded into the
/// batch size, so callers normally observe the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Accumulating,
    Dispatching,
    AdjustSize,
}

/// Batch size controller.
///
/// Outside a ±20% band around the target duration the size is scaled by
/// `1 ± adjustment_factor`, moving at least one item, within
/// `[min_batch_size, max_batch_size]`.
#[derive(Debug, Clone)]
pub struct AdaptiveState {
    current_batch_size: usize,
    min_batch_size: usize,
    max_batch_size: usize,
    target_duration: Duration,
    adjustment_factor: f64,
}

impl AdaptiveState {
    pub fn new(config: &AdaptiveConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            current_batch_size: config.initial_batch_size,
            min_batch_size: config.min_batch_size,
            max_batch_size: config.max_batch_size,
            target_duration: config.target_duration,
            adjustment_factor: config.adjustment_factor,
        })
    }

    pub fn current_batch_size(&self) -> usize {
        self.current_batch_size
    }

    pub fn target_duration(&self) -> Duration {
        self.target_duration
    }

    /// Fold one successful batch duration in and return the new size.
    ///
    /// Below 80% of the target the size grows by `adjustment_factor`, above
    /// 120% it shrinks by it, and in between it holds. A step always moves
    /// the size by at least one item so small sizes can still adapt, and the
    /// result stays within `[min_batch_size, max_batch_size]`.
    pub fn observe(&mut self, duration: Duration) -> usize {
        // compared in tenths of the target to keep the band edges exact
        let target = self.target_duration.as_nanos();
        let observed = duration.as_nanos() * 10;
        let current = self.current_batch_size;

        self.current_batch_size = if observed < target * 8 {
            let grown = (current as f64 * (1.0 + self.adjustment_factor)) as usize;
            grown.max(current + 1).min(self.max_batch_size)
        } else if observed > target * 12 {
            let shrunk = (current as f64 * (1.0 - self.adjustment_factor)) as usize;
            shrunk.min(current.saturating_sub(1)).max(self.min_batch_size)
        } else {
            current
        };
        self.current_batch_size
    }
}

/// Streaming batch processor that tunes its batch size so each batch takes
/// roughly `target_duration`.
///
/// Only successful batches feed the adjustment.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchProcessor<T, R> {
    inner: StreamingBatchProcessor<T, R>,
}

impl<T, R> AdaptiveBatchProcessor<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    /// `batch` supplies concurrency and auto-flush settings; its
    /// `batch_size` is superseded by `adaptive.initial_batch_size`.
    pub fn new(batch_fn: BatchFn<T, R>, adaptive: AdaptiveConfig, batch: BatchConfig) -> Result<Self> {
        let state = AdaptiveState::new(&adaptive)?;
        let batch = BatchConfig {
            batch_size: adaptive.initial_batch_size,
            ..batch
        };
        batch.validate()?;
        Ok(Self {
            inner: StreamingBatchProcessor::build(batch_fn, &batch, Some(state)),
        })
    }

    pub async fn add(&self, item: T) -> Option<BatchResult<T, R>> {
        self.inner.add(item).await
    }

    pub async fn add_many<I>(&self, items: I) -> Vec<BatchResult<T, R>>
    where
        I: IntoIterator<Item = T>,
    {
        self.inner.add_many(items).await
    }

    pub async fn flush(&self) -> Option<BatchResult<T, R>> {
        self.inner.flush().await
    }

    pub fn start_auto_flush(&self) -> Result<AutoFlushHandle> {
        self.inner.start_auto_flush()
    }

    pub fn take_completed(&self) -> Vec<BatchResult<T, R>> {
        self.inner.take_completed()
    }

    pub fn current_batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    pub fn state(&self) -> ProcessorState {
        self.inner.state()
    }

    pub fn statistics(&self) -> BatchStatistics {
        self.inner.statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Processor;

    fn state(initial: usize, min: usize, max: usize) -> AdaptiveState {
        AdaptiveState::new(
            &AdaptiveConfig::default()
                .with_bounds(min, max)
                .with_initial_batch_size(initial)
                .with_target_duration(Duration::from_millis(100))
                .with_adjustment_factor(0.5),
        )
        .unwrap()
    }

    #[test]
    fn test_grows_when_fast() {
        let mut s = state(10, 1, 100);
        assert_eq!(s.observe(Duration::from_millis(50)), 15);
    }

    #[test]
    fn test_shrinks_when_slow() {
        let mut s = state(10, 1, 100);
        assert_eq!(s.observe(Duration::from_millis(200)), 5);
    }

    #[test]
    fn test_hysteresis_band_holds() {
        let mut s = state(10, 1, 100);
        for ms in [80, 95, 100, 110, 120] {
            assert_eq!(s.observe(Duration::from_millis(ms)), 10);
        }
    }

    #[test]
    fn test_bounds_respected() {
        let mut s = state(90, 5, 100);
        assert_eq!(s.observe(Duration::from_millis(1)), 100);
        assert_eq!(s.observe(Duration::from_millis(1)), 100);

        let mut s = state(6, 5, 100);
        assert_eq!(s.observe(Duration::from_secs(5)), 5);
        assert_eq!(s.observe(Duration::from_secs(5)), 5);
    }

    #[test]
    fn test_small_sizes_still_move() {
        // 1 * 1.5 truncates back to 1 without the one-item floor
        let mut s = state(1, 1, 10);
        assert_eq!(s.observe(Duration::ZERO), 2);
        let mut s = state(3, 1, 10);
        assert_eq!(s.observe(Duration::from_secs(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batches_do_not_adapt() {
        let failing: BatchFn<u32, u32> =
            Processor::from_fn(|_: Vec<u32>| Err::<Vec<u32>, _>("backend down"));
        let processor = AdaptiveBatchProcessor::new(
            failing,
            AdaptiveConfig::default().with_initial_batch_size(4),
            BatchConfig::default(),
        )
        .unwrap();

        let batches = processor.add_many(0..12).await;
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| !b.success()));
        assert_eq!(processor.current_batch_size(), 4);
        assert_eq!(processor.statistics().failed_batches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_grows_for_fast_batches() {
        let instant: BatchFn<u32, u32> = Processor::infallible(|xs: Vec<u32>| xs);
        let processor = AdaptiveBatchProcessor::new(
            instant,
            AdaptiveConfig::default()
                .with_initial_batch_size(2)
                .with_bounds(1, 8),
            BatchConfig::default(),
        )
        .unwrap();

        processor.add_many(0..100).await;
        assert_eq!(processor.current_batch_size(), 8);
        assert_eq!(processor.state(), ProcessorState::Accumulating);
    }
}
