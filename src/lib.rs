//! Politeness and throughput control for concurrent work.
//!
//! This crate bounds how fast and how much work is in flight:
//!
//! # Features
//!
//! - Sliding window, token bucket and leaky bucket rate limiters behind one
//!   async [`RateLimiter`] trait
//! - A bounded FIFO or priority work queue that blocks producers when full
//! - A producer/consumer [`Pipeline`] with soft (watermark) and hard (full
//!   queue) backpressure, per-item error isolation and cancellation
//! - One-shot, streaming and adaptive batch processors
//! - Latency percentiles and counters for every pipeline run
//! - TOML and environment configuration, `tracing` based logging
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use throttled_pipeline::{PipelineBuilder, Processor, SlidingWindowLimiter};
//!
//! # async fn demo() -> throttled_pipeline::Result<()> {
//! let limiter = Arc::new(SlidingWindowLimiter::new(5, Duration::from_secs(1))?);
//! let pipeline = PipelineBuilder::new()
//!     .max_queue_size(10)
//!     .num_consumers(3)
//!     .rate_limiter(limiter)
//!     .build::<u64>()?;
//!
//! let report = pipeline.run(0..20u64, Processor::infallible(|x: u64| x * 2)).await?;
//! assert_eq!(report.records.len(), 20);
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod batch;
pub mod config;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod processor;
pub mod queue;

// Re-exports for convenience
pub use backpressure::BackpressureController;
pub use batch::{
    AdaptiveBatchProcessor, BatchProcessor, BatchResult, BatchStatistics, ProcessorState,
    StreamingBatchProcessor,
};
pub use config::{
    AdaptiveConfig, BatchConfig, LimiterConfig, LimiterKind, PipelineConfig, ThrottleConfig,
    WorkerKind,
};
pub use error::{PipelineError, ProcessingError, Result};
pub use limiter::{
    Admission, LeakyBucket, LimiterStatistics, RateLimiter, SlidingWindowLimiter, TokenBucket,
};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineReport, ResultRecord, Submission};
pub use processor::{BatchFn, ProcessResult, Processor};
pub use queue::{BoundedWorkQueue, QueueOrder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
