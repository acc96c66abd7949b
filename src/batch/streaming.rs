use super::adaptive::{AdaptiveState, ProcessorState};
use super::{execute_batch, BatchResult, BatchStatistics};
use crate::config::BatchConfig;
use crate::error::{PipelineError, Result};
use crate::processor::BatchFn;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

struct StreamState<T, R> {
    pending: Vec<T>,
    /// When the first item of `pending` arrived
    oldest: Option<Instant>,
    batch_size: usize,
    adaptive: Option<AdaptiveState>,
    phase: ProcessorState,
    in_flight: usize,
    stats: BatchStatistics,
    /// Batches flushed by the auto-flush task, awaiting `take_completed`
    completed: VecDeque<BatchResult<T, R>>,
}

impl<T, R> StreamState<T, R> {
    fn current_batch_size(&self) -> usize {
        self.adaptive
            .as_ref()
            .map_or(self.batch_size, |a| a.current_batch_size())
    }

    fn take_pending(&mut self) -> Vec<T> {
        let capacity = self.current_batch_size();
        self.oldest = None;
        self.in_flight += 1;
        self.transition(ProcessorState::Dispatching);
        std::mem::replace(&mut self.pending, Vec::with_capacity(capacity))
    }

    fn transition(&mut self, next: ProcessorState) {
        if self.phase != next {
            debug!(from = ?self.phase, to = ?next, "batch processor state");
            self.phase = next;
        }
    }
}

struct Shared<T, R> {
    batch_fn: BatchFn<T, R>,
    state: Mutex<StreamState<T, R>>,
    /// Bounds batches in flight across concurrent callers
    permits: Semaphore,
    next_batch_id: AtomicU64,
    auto_flush_interval: Option<Duration>,
}

/// Accumulates items and dispatches them in batches.
///
/// Cheap to clone; clones share the pending batch, statistics and
/// auto-flush results. Dropping an `add` or `flush` future mid-dispatch does
/// not lose the batch; it finishes and is kept for `take_completed`.
pub struct StreamingBatchProcessor<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> Clone for StreamingBatchProcessor<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, R> std::fmt::Debug for StreamingBatchProcessor<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StreamingBatchProcessor")
            .field("pending", &state.pending.len())
            .field("batch_size", &state.current_batch_size())
            .field("phase", &state.phase)
            .finish()
    }
}

impl<T, R> StreamingBatchProcessor<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new(batch_fn: BatchFn<T, R>, config: BatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(batch_fn, &config, None))
    }

    pub(crate) fn build(
        batch_fn: BatchFn<T, R>,
        config: &BatchConfig,
        adaptive: Option<AdaptiveState>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                batch_fn,
                state: Mutex::new(StreamState {
                    pending: Vec::new(),
                    oldest: None,
                    batch_size: config.batch_size,
                    adaptive,
                    phase: ProcessorState::Accumulating,
                    in_flight: 0,
                    stats: BatchStatistics::default(),
                    completed: VecDeque::new(),
                }),
                permits: Semaphore::new(config.max_concurrent_batches),
                next_batch_id: AtomicU64::new(0),
                auto_flush_interval: config.auto_flush_interval,
            }),
        }
    }

    /// Add one item. Dispatches and returns the batch if this item filled it.
    pub async fn add(&self, item: T) -> Option<BatchResult<T, R>> {
        let ready = {
            let mut state = self.shared.state.lock();
            if state.pending.is_empty() {
                state.oldest = Some(Instant::now());
            }
            state.pending.push(item);
            (state.pending.len() >= state.current_batch_size()).then(|| state.take_pending())
        };
        match ready {
            Some(items) => self.dispatch(items).await,
            None => None,
        }
    }

    /// Add items in order, returning every batch that filled up meanwhile.
    ///
    /// Batches are dispatched one after another, so each sees the batch
    /// size left by its predecessor.
    pub async fn add_many<I>(&self, items: I) -> Vec<BatchResult<T, R>>
    where
        I: IntoIterator<Item = T>,
    {
        let mut results = Vec::new();
        for item in items {
            if let Some(result) = self.add(item).await {
                results.push(result);
            }
        }
        results
    }

    /// Dispatch the partial batch, if any.
    pub async fn flush(&self) -> Option<BatchResult<T, R>> {
        let items = {
            let mut state = self.shared.state.lock();
            if state.pending.is_empty() {
                return None;
            }
            state.take_pending()
        };
        self.dispatch(items).await
    }

    /// Dispatch the partial batch if its oldest item has waited `max_age`.
    async fn flush_if_stale(&self, max_age: Duration) -> Option<BatchResult<T, R>> {
        let items = {
            let mut state = self.shared.state.lock();
            let stale = state.oldest.is_some_and(|t| t.elapsed() >= max_age);
            if !stale || state.pending.is_empty() {
                return None;
            }
            state.take_pending()
        };
        debug!(size = items.len(), "auto-flushing stale batch");
        self.dispatch(items).await
    }

    /// Run one batch on its own task and wait for it.
    ///
    /// The batch finishes even if the caller stops waiting; its result then
    /// lands in the completed queue for [`take_completed`](Self::take_completed)
    /// so no item goes unaccounted for.
    async fn dispatch(&self, items: Vec<T>) -> Option<BatchResult<T, R>> {
        let batch_id = self.shared.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let result = {
                // the semaphore is never closed
                let _permit = shared.permits.acquire().await.ok();
                execute_batch(batch_id, items, &shared.batch_fn).await
            };
            Self::complete(&shared, &result);
            if let Err(result) = tx.send(result) {
                debug!(batch_id, "caller gone, keeping batch result");
                shared.state.lock().completed.push_back(result);
            }
        });

        match rx.await {
            Ok(result) => Some(result),
            Err(_) => {
                warn!(batch_id, "batch task dropped before completing");
                None
            }
        }
    }

    fn complete(shared: &Shared<T, R>, result: &BatchResult<T, R>) {
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        state.stats.record(result);
        state.in_flight = state.in_flight.saturating_sub(1);

        if state.adaptive.is_some() {
            state.transition(ProcessorState::AdjustSize);
        }
        if let Some(adaptive) = state.adaptive.as_mut() {
            if result.success() {
                let before = adaptive.current_batch_size();
                let after = adaptive.observe(result.duration());
                if before != after {
                    debug!(
                        batch_id = result.batch_id,
                        duration_ms = result.duration().as_millis() as u64,
                        from = before,
                        to = after,
                        "batch size adjusted"
                    );
                }
            }
        }

        let next = if state.in_flight > 0 {
            ProcessorState::Dispatching
        } else {
            ProcessorState::Accumulating
        };
        state.transition(next);
    }

    /// Start the periodic auto-flush task.
    ///
    /// Requires `auto_flush_interval` in the config. The task checks twice
    /// per interval and flushes a partial batch whose oldest item is at
    /// least one interval old; results are queued for
    /// [`take_completed`](Self::take_completed). It stops when the handle is
    /// dropped or its token is cancelled, or once every processor clone is
    /// gone.
    pub fn start_auto_flush(&self) -> Result<AutoFlushHandle> {
        let interval = self
            .shared
            .auto_flush_interval
            .ok_or_else(|| PipelineError::config("auto_flush_interval is not configured"))?;

        let token = CancellationToken::new();
        let stop = token.clone();
        let shared: Weak<Shared<T, R>> = Arc::downgrade(&self.shared);
        let period = (interval / 2).max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(shared) = shared.upgrade() else { break };
                let processor = StreamingBatchProcessor { shared };
                if let Some(result) = processor.flush_if_stale(interval).await {
                    processor.shared.state.lock().completed.push_back(result);
                }
            }
            debug!("auto-flush stopped");
        });

        Ok(AutoFlushHandle {
            token: token.clone(),
            task,
            _guard: token.drop_guard(),
        })
    }

    /// Batches finished with nobody waiting on them since the last call:
    /// auto-flushed batches and those whose `add` or `flush` caller gave up.
    pub fn take_completed(&self) -> Vec<BatchResult<T, R>> {
        self.shared.state.lock().completed.drain(..).collect()
    }

    /// Items waiting for the next dispatch
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn batch_size(&self) -> usize {
        self.shared.state.lock().current_batch_size()
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.state.lock().phase
    }

    pub fn statistics(&self) -> BatchStatistics {
        self.shared.state.lock().stats.clone()
    }
}

/// Controls a running auto-flush task; dropping it stops the task.
#[derive(Debug)]
pub struct AutoFlushHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    _guard: DropGuard,
}

impl AutoFlushHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the task and wait for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "auto-flush task ended abnormally");
        }
    }
}
