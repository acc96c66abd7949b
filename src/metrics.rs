use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A simple percentile tracker that maintains a sliding window of measurements
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    /// Create a new percentile tracker keeping the last `window_size` samples
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            measurements: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    pub fn record(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let mut measurements = self.measurements.lock();
        if measurements.len() >= self.window_size {
            measurements.pop_front();
        }
        measurements.push_back(nanos);
    }

    pub fn p50(&self) -> Duration {
        self.percentile(0.50)
    }

    pub fn p95(&self) -> Duration {
        self.percentile(0.95)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> Duration {
        let measurements = self.measurements.lock();
        if measurements.is_empty() {
            return Duration::ZERO;
        }

        let mut sorted: Vec<_> = measurements.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        Duration::from_nanos(sorted[idx])
    }

    pub fn count(&self) -> usize {
        self.measurements.lock().len()
    }
}

/// Counters and latency distributions for one pipeline.
///
/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
    /// Soft backpressure pauses taken by the producer
    throttles: Arc<AtomicU64>,
    /// Time items spent queued before a consumer took them
    wait_latency: PercentileTracker,
    /// Time spent inside the processor
    process_latency: PercentileTracker,
    start_time: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicU64::new(0)),
            throttles: Arc::new(AtomicU64::new(0)),
            wait_latency: PercentileTracker::new(1000),
            process_latency: PercentileTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    /// Record a successfully processed item
    pub fn record_processed(&self, wait: Duration, process: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.wait_latency.record(wait);
        self.process_latency.record(process);
    }

    /// Record an item whose processor call failed
    pub fn record_failed(&self, wait: Duration, process: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.wait_latency.record(wait);
        self.process_latency.record(process);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle(&self) {
        self.throttles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn total_throttles(&self) -> u64 {
        self.throttles.load(Ordering::Relaxed)
    }

    /// Completed items (successful or failed) per second since creation
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let total = self.total_processed() + self.total_failed();
        if elapsed == 0.0 {
            0.0
        } else {
            total as f64 / elapsed
        }
    }

    /// Take a snapshot; `blocks` comes from the queue, which owns that counter
    pub fn snapshot(&self, blocks: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            total_processed: self.total_processed(),
            total_failed: self.total_failed(),
            total_cancelled: self.total_cancelled(),
            total_throttles: self.total_throttles(),
            total_blocks: blocks,
            throughput: self.throughput(),
            wait_p50: self.wait_latency.p50(),
            wait_p99: self.wait_latency.p99(),
            process_p50: self.process_latency.p50(),
            process_p95: self.process_latency.p95(),
            process_p99: self.process_latency.p99(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_throttles: u64,
    pub total_blocks: u64,
    pub throughput: f64,
    pub wait_p50: Duration,
    pub wait_p99: Duration,
    pub process_p50: Duration,
    pub process_p95: Duration,
    pub process_p99: Duration,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Processed: {}, Failed: {}, Cancelled: {}, Throttles: {}, Blocks: {}, \
             Throughput: {:.2} items/s, Wait P50: {:?}, P99: {:?}, \
             Process P50: {:?}, P95: {:?}, P99: {:?}, Elapsed: {:.2}s",
            self.total_processed,
            self.total_failed,
            self.total_cancelled,
            self.total_throttles,
            self.total_blocks,
            self.throughput,
            self.wait_p50,
            self.wait_p99,
            self.process_p50,
            self.process_p95,
            self.process_p99,
            self.elapsed.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_tracker() {
        let tracker = PercentileTracker::new(10);
        for i in 1..=10 {
            tracker.record(Duration::from_micros(i));
        }
        assert_eq!(tracker.p50(), Duration::from_micros(5));
        assert_eq!(tracker.p99(), Duration::from_micros(10));
    }

    #[test]
    fn test_percentile_tracker_window_evicts_oldest() {
        let tracker = PercentileTracker::new(3);
        for ms in [100, 1, 2, 3] {
            tracker.record(Duration::from_millis(ms));
        }
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.p99(), Duration::from_millis(3));
    }

    #[test]
    fn test_pipeline_metrics() {
        let metrics = PipelineMetrics::new();
        for _ in 0..10 {
            metrics.record_processed(Duration::from_millis(1), Duration::from_millis(2));
        }
        metrics.record_failed(Duration::ZERO, Duration::from_millis(5));
        metrics.record_cancelled();
        metrics.record_throttle();

        let snapshot = metrics.snapshot(3);
        assert_eq!(snapshot.total_processed, 10);
        assert_eq!(snapshot.total_failed, 1);
        assert_eq!(snapshot.total_cancelled, 1);
        assert_eq!(snapshot.total_throttles, 1);
        assert_eq!(snapshot.total_blocks, 3);
        assert_eq!(snapshot.process_p50, Duration::from_millis(2));
        assert!(snapshot.format().contains("Processed: 10"));
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = PipelineMetrics::new();
        let clone = metrics.clone();
        clone.record_throttle();
        assert_eq!(metrics.total_throttles(), 1);
    }
}
