use crate::backpressure::BackpressureController;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, ProcessingError, Result};
use crate::limiter::RateLimiter;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::processor::{ProcessResult, Processor};
use crate::queue::{BoundedWorkQueue, QueueOrder};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A source item with an explicit priority.
///
/// Bare `T` values convert into a `Submission` with priority 0.
#[derive(Debug, Clone)]
pub struct Submission<T> {
    pub payload: T,
    pub priority: i32,
}

impl<T> Submission<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            priority: 0,
        }
    }

    /// Higher priorities are dequeued first when the priority queue is on
    pub fn with_priority(payload: T, priority: i32) -> Self {
        Self { payload, priority }
    }
}

impl<T> From<T> for Submission<T> {
    fn from(payload: T) -> Self {
        Self::new(payload)
    }
}

/// A unit of work travelling from the producer to a consumer
#[derive(Debug)]
pub struct WorkItem<T> {
    pub id: u64,
    pub payload: T,
    pub priority: i32,
    /// When the item entered the queue
    pub enqueued_at: Instant,
}

enum Message<T> {
    Work(WorkItem<T>),
    /// One per consumer, pushed after the source is exhausted
    Done,
}

/// Outcome of one work item
#[derive(Debug, Clone)]
pub struct ResultRecord<R> {
    pub work_item_id: u64,
    /// `None` when the item was cancelled before any consumer took it
    pub consumer_id: Option<usize>,
    pub result: ProcessResult<R>,
    pub wait_duration: Duration,
    pub process_duration: Duration,
}

impl<R> ResultRecord<R> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    fn cancelled(work_item_id: u64) -> Self {
        Self {
            work_item_id,
            consumer_id: None,
            result: Err(ProcessingError::Cancelled),
            wait_duration: Duration::ZERO,
            process_duration: Duration::ZERO,
        }
    }
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct PipelineReport<R> {
    /// One record per item pulled from the source, in completion order
    pub records: Vec<ResultRecord<R>>,
    pub cancelled: bool,
    pub metrics: MetricsSnapshot,
}

impl<R> PipelineReport<R> {
    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| r.is_success()).count()
    }

    /// Items whose processor call failed or panicked
    pub fn failed(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(&r.result, Err(e) if !e.is_cancelled()))
            .count()
    }

    pub fn cancelled_items(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(&r.result, Err(e) if e.is_cancelled()))
            .count()
    }

    /// Reorder records by work item id, i.e. source order.
    pub fn sort_by_id(&mut self) {
        self.records.sort_by_key(|r| r.work_item_id);
    }
}

/// Builder for constructing pipelines
pub struct PipelineBuilder {
    config: PipelineConfig,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    cancel: Option<CancellationToken>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::from_config(PipelineConfig::default())
    }

    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config,
            rate_limiter: None,
            cancel: None,
        }
    }

    /// Capacity of the work queue; a full queue blocks the producer
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    pub fn num_consumers(mut self, n: usize) -> Self {
        self.config.num_consumers = n;
        self
    }

    pub fn priority_queue(mut self, enable: bool) -> Self {
        self.config.use_priority_queue = enable;
        self
    }

    /// Every item waits on this limiter before it is queued
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Enable or disable soft backpressure
    pub fn with_backpressure(mut self, enable: bool) -> Self {
        self.config.backpressure = enable;
        self
    }

    pub fn watermarks(mut self, high: u32, low: u32) -> Self {
        self.config.high_watermark = high;
        self.config.low_watermark = low;
        self
    }

    pub fn throttle_delay(mut self, delay: Duration) -> Self {
        self.config.throttle_delay = delay;
        self
    }

    /// Use an externally owned token so the caller can cancel a run
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Build the pipeline
    pub fn build<T>(self) -> Result<Pipeline<T>> {
        self.config.validate()?;

        let order = if self.config.use_priority_queue {
            QueueOrder::Priority
        } else {
            QueueOrder::Fifo
        };
        let queue = BoundedWorkQueue::new(self.config.max_queue_size, order)?;

        let backpressure = if self.config.backpressure {
            let delay = self.config.throttle_delay;
            Some(
                BackpressureController::with_watermarks(
                    self.config.high_watermark,
                    self.config.low_watermark,
                )?
                .with_delay(delay, delay.saturating_mul(8)),
            )
        } else {
            None
        };

        Ok(Pipeline {
            queue: Arc::new(queue),
            num_consumers: self.config.num_consumers,
            rate_limiter: self.rate_limiter,
            backpressure,
            metrics: Mutex::new(PipelineMetrics::new()),
            blocks_at_start: AtomicU64::new(0),
            cancel: self.cancel.unwrap_or_default(),
            next_id: AtomicU64::new(0),
            is_running: AtomicBool::new(false),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded producer/consumer pipeline.
///
/// The producer runs on the caller's task, consumers are spawned tokio
/// tasks. A run ends when the source is exhausted and every consumer has
/// seen its `Done` sentinel, or when the cancellation token fires.
pub struct Pipeline<T> {
    queue: Arc<BoundedWorkQueue<Message<T>>>,
    num_consumers: usize,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    backpressure: Option<BackpressureController>,
    /// Replaced at the start of every run
    metrics: Mutex<PipelineMetrics>,
    /// Queue block count when the current run started
    blocks_at_start: AtomicU64,
    cancel: CancellationToken,
    next_id: AtomicU64,
    is_running: AtomicBool,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> Pipeline<T>
where
    T: Send + 'static,
{
    /// Process every item of `source` with `processor`.
    pub async fn run<I, R>(&self, source: I, processor: Processor<T, R>) -> Result<PipelineReport<R>>
    where
        I: IntoIterator,
        I::Item: Into<Submission<T>>,
        R: Send + 'static,
    {
        self.run_stream(futures::stream::iter(source), processor).await
    }

    /// Process every item of an async `source` with `processor`.
    ///
    /// The source is pulled exactly once, in order. Fails only with
    /// `AlreadyRunning` or when a consumer task dies outside the processor.
    pub async fn run_stream<S, R>(
        &self,
        source: S,
        processor: Processor<T, R>,
    ) -> Result<PipelineReport<R>>
    where
        S: Stream,
        S::Item: Into<Submission<T>>,
        R: Send + 'static,
    {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.is_running);

        let metrics = PipelineMetrics::new();
        *self.metrics.lock() = metrics.clone();
        self.blocks_at_start
            .store(self.queue.blocked_count(), Ordering::Relaxed);
        if let Some(controller) = &self.backpressure {
            controller.reset();
        }

        debug!(
            consumers = self.num_consumers,
            capacity = self.queue.capacity(),
            async_processor = processor.is_async(),
            "pipeline starting"
        );

        let records = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = JoinSet::new();
        for consumer_id in 0..self.num_consumers {
            consumers.spawn(consume(
                consumer_id,
                Arc::clone(&self.queue),
                processor.clone(),
                metrics.clone(),
                self.cancel.clone(),
                Arc::clone(&records),
            ));
        }

        let discarded = self.produce(source, &metrics).await;

        let mut join_error = None;
        while let Some(joined) = consumers.join_next().await {
            if let Err(err) = joined {
                join_error.get_or_insert_with(|| err.to_string());
            }
        }

        let mut records = std::mem::take(&mut *records.lock());
        let leftover = self.queue.drain();
        for id in discarded.into_iter().chain(leftover.into_iter().filter_map(|m| match m {
            Message::Work(item) => Some(item.id),
            Message::Done => None,
        })) {
            metrics.record_cancelled();
            records.push(ResultRecord::cancelled(id));
        }

        if let Some(err) = join_error {
            return Err(PipelineError::TaskJoin(err));
        }

        let report = PipelineReport {
            records,
            cancelled: self.cancel.is_cancelled(),
            metrics: self.metrics(),
        };
        info!(
            items = report.records.len(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "pipeline finished"
        );
        Ok(report)
    }

    /// Feed the queue. Returns ids of items pulled from the source but never
    /// queued because the run was cancelled.
    async fn produce<S>(&self, source: S, metrics: &PipelineMetrics) -> Vec<u64>
    where
        S: Stream,
        S::Item: Into<Submission<T>>,
    {
        tokio::pin!(source);
        let mut discarded = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = source.next() => next,
            };
            let Some(submission) = next else { break };
            let Submission { payload, priority }: Submission<T> = submission.into();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);

            if !self.admit(metrics).await {
                discarded.push(id);
                break;
            }

            let item = WorkItem {
                id,
                payload,
                priority,
                enqueued_at: Instant::now(),
            };
            let queued = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                _ = self.queue.submit_with(
                    Message::Work(item),
                    priority,
                    &stamp_enqueued::<T>,
                ) => true,
            };
            if !queued {
                discarded.push(id);
                break;
            }
        }

        for _ in 0..self.num_consumers {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.queue.submit(Message::Done, i32::MIN) => {}
            }
        }
        discarded
    }

    /// Rate limit, then soft backpressure. False if cancelled meanwhile.
    async fn admit(&self, metrics: &PipelineMetrics) -> bool {
        if let Some(limiter) = &self.rate_limiter {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = limiter.acquire() => {}
            }
        }

        if let Some(controller) = &self.backpressure {
            if controller.check_and_update(self.queue.utilization()) {
                let throttled = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return false,
                    throttled = controller.throttle() => throttled,
                };
                if throttled {
                    metrics.record_throttle();
                }
            }
        }
        true
    }
}

impl<T> Pipeline<T> {
    /// Stop producing and consuming; in-flight items still complete.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Metrics of the current run, or of the last one once it has finished
    pub fn metrics(&self) -> MetricsSnapshot {
        let blocks = self
            .queue
            .blocked_count()
            .saturating_sub(self.blocks_at_start.load(Ordering::Relaxed));
        self.metrics.lock().snapshot(blocks)
    }

    pub fn backpressure(&self) -> Option<&BackpressureController> {
        self.backpressure.as_ref()
    }

    /// Messages currently queued, sentinels included
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn num_consumers(&self) -> usize {
        self.num_consumers
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}

/// Restamp a work item the moment it enters the queue, so its wait excludes
/// time the producer spent blocked on a full queue.
fn stamp_enqueued<T>(message: &mut Message<T>) {
    if let Message::Work(item) = message {
        item.enqueued_at = Instant::now();
    }
}

async fn consume<T, R>(
    consumer_id: usize,
    queue: Arc<BoundedWorkQueue<Message<T>>>,
    processor: Processor<T, R>,
    metrics: PipelineMetrics,
    cancel: CancellationToken,
    records: Arc<Mutex<Vec<ResultRecord<R>>>>,
) where
    T: Send + 'static,
    R: Send + 'static,
{
    debug!(consumer_id, "consumer started");
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = queue.take() => message,
        };
        let item = match message {
            Message::Work(item) => item,
            Message::Done => break,
        };

        let wait_duration = item.enqueued_at.elapsed();
        let started = Instant::now();
        let result = processor.invoke(item.payload).await;
        let process_duration = started.elapsed();

        match &result {
            Ok(_) => metrics.record_processed(wait_duration, process_duration),
            Err(err) => {
                warn!(consumer_id, work_item_id = item.id, error = %err, "work item failed");
                metrics.record_failed(wait_duration, process_duration);
            }
        }

        records.lock().push(ResultRecord {
            work_item_id: item.id,
            consumer_id: Some(consumer_id),
            result,
            wait_duration,
            process_duration,
        });
    }
    debug!(consumer_id, "consumer exiting");
}
