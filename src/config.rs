//! Configuration for limiters, pipelines and batch processors.
//!
//! Every section can be built in code with `with_*` setters or loaded from
//! TOML. Durations are written as fractional seconds:
//!
//! ```toml
//! [limiter]
//! kind = "sliding_window"
//! rate = 5
//! per = 1.0
//!
//! [pipeline]
//! max_queue_size = 10
//! num_consumers = 3
//!
//! [adaptive]
//! target_duration = 0.5
//! ```
//!
//! # Environment Variables
//!
//! [`ThrottleConfig::with_env_overrides`] applies these on top of a loaded
//! config. Invalid values leave the current setting untouched.
//!
//! | Variable | Field |
//! |---|---|
//! | `THROTTLE_RATE` | `limiter.rate` |
//! | `THROTTLE_PER_SECS` | `limiter.per` |
//! | `THROTTLE_BURST` | `limiter.burst` |
//! | `THROTTLE_MAX_QUEUE_SIZE` | `pipeline.max_queue_size` |
//! | `THROTTLE_NUM_CONSUMERS` | `pipeline.num_consumers` |
//! | `THROTTLE_BATCH_SIZE` | `batch.batch_size` |
//! | `THROTTLE_MAX_CONCURRENT_BATCHES` | `batch.max_concurrent_batches` |
//! | `THROTTLE_LOG_LEVEL` | `logging.level` |

use crate::error::{PipelineError, Result};
use crate::limiter::{LeakyBucket, RateLimiter, SlidingWindowLimiter, TokenBucket};
use crate::logging::LogConfig;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(value).map_err(serde::de::Error::custom)
}

fn opt_secs<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<f64>::deserialize(deserializer)? {
        Some(value) => Duration::try_from_secs_f64(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Which rate limiting algorithm to build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    #[default]
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

/// `rate` permits per `per`, with an optional `burst` capacity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub kind: LimiterKind,
    pub rate: u32,
    #[serde(deserialize_with = "secs")]
    pub per: Duration,
    /// Bucket capacity for the bucket variants; defaults to `rate`
    pub burst: Option<u32>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            kind: LimiterKind::SlidingWindow,
            rate: 10,
            per: Duration::from_secs(1),
            burst: None,
        }
    }
}

impl LimiterConfig {
    pub fn new(kind: LimiterKind, rate: u32, per: Duration) -> Self {
        Self {
            kind,
            rate,
            per,
            burst: None,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(PipelineError::config("limiter rate must be positive"));
        }
        if self.per.is_zero() {
            return Err(PipelineError::config("limiter period must be positive"));
        }
        if self.burst == Some(0) {
            return Err(PipelineError::config("limiter burst must be positive"));
        }
        Ok(())
    }

    /// Construct the configured limiter.
    pub fn build(&self) -> Result<Arc<dyn RateLimiter>> {
        self.validate()?;
        let limiter: Arc<dyn RateLimiter> = match self.kind {
            LimiterKind::SlidingWindow => Arc::new(SlidingWindowLimiter::new(self.rate, self.per)?),
            LimiterKind::TokenBucket => {
                Arc::new(TokenBucket::per_period(self.rate, self.per, self.burst)?)
            }
            LimiterKind::LeakyBucket => Arc::new(LeakyBucket::new(
                self.burst.unwrap_or(self.rate) as f64,
                self.rate as f64 / self.per.as_secs_f64(),
            )?),
        };
        Ok(limiter)
    }
}

/// Producer/consumer pipeline settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_queue_size: usize,
    pub num_consumers: usize,
    pub use_priority_queue: bool,
    /// Soft backpressure ahead of the hard block on a full queue
    pub backpressure: bool,
    pub high_watermark: u32,
    pub low_watermark: u32,
    #[serde(deserialize_with = "secs")]
    pub throttle_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            num_consumers: 4,
            use_priority_queue: false,
            backpressure: true,
            high_watermark: 80,
            low_watermark: 50,
            throttle_delay: Duration::from_millis(5),
        }
    }
}

impl PipelineConfig {
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_num_consumers(mut self, n: usize) -> Self {
        self.num_consumers = n;
        self
    }

    pub fn with_priority_queue(mut self, enable: bool) -> Self {
        self.use_priority_queue = enable;
        self
    }

    pub fn with_backpressure(mut self, enable: bool) -> Self {
        self.backpressure = enable;
        self
    }

    pub fn with_watermarks(mut self, high: u32, low: u32) -> Self {
        self.high_watermark = high;
        self.low_watermark = low;
        self
    }

    pub fn with_throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(PipelineError::config("max_queue_size must be positive"));
        }
        if self.num_consumers == 0 {
            return Err(PipelineError::config("num_consumers must be positive"));
        }
        if self.high_watermark > 100 || self.low_watermark > self.high_watermark {
            return Err(PipelineError::config(format!(
                "invalid watermarks: high={}%, low={}%",
                self.high_watermark, self.low_watermark
            )));
        }
        Ok(())
    }
}

/// How parallel batches are executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Tokio tasks, for I/O-bound batch functions
    #[default]
    Tasks,
    /// Dedicated OS threads, for CPU-bound batch functions
    Threads,
}

/// Batch splitting and dispatch settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Upper bound on batches in flight at once
    pub max_concurrent_batches: usize,
    pub worker_kind: WorkerKind,
    /// Flush a partial streaming batch once its oldest item is this old
    #[serde(deserialize_with = "opt_secs")]
    pub auto_flush_interval: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_batches: num_cpus::get().max(1),
            worker_kind: WorkerKind::Tasks,
            auto_flush_interval: None,
        }
    }
}

impl BatchConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent_batches(mut self, n: usize) -> Self {
        self.max_concurrent_batches = n;
        self
    }

    pub fn with_worker_kind(mut self, kind: WorkerKind) -> Self {
        self.worker_kind = kind;
        self
    }

    pub fn with_auto_flush(mut self, interval: Duration) -> Self {
        self.auto_flush_interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::config("batch_size must be positive"));
        }
        if self.max_concurrent_batches == 0 {
            return Err(PipelineError::config("max_concurrent_batches must be positive"));
        }
        if self.auto_flush_interval.is_some_and(|d| d.is_zero()) {
            return Err(PipelineError::config("auto_flush_interval must be positive"));
        }
        Ok(())
    }
}

/// Batch size adaptation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    #[serde(deserialize_with = "secs")]
    pub target_duration: Duration,
    /// Relative step applied when a batch is outside the ±20% band
    pub adjustment_factor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 10,
            min_batch_size: 1,
            max_batch_size: 1000,
            target_duration: Duration::from_secs(1),
            adjustment_factor: 0.2,
        }
    }
}

impl AdaptiveConfig {
    pub fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_batch_size = min;
        self.max_batch_size = max;
        self
    }

    pub fn with_initial_batch_size(mut self, size: usize) -> Self {
        self.initial_batch_size = size;
        self
    }

    pub fn with_target_duration(mut self, target: Duration) -> Self {
        self.target_duration = target;
        self
    }

    pub fn with_adjustment_factor(mut self, factor: f64) -> Self {
        self.adjustment_factor = factor;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_batch_size == 0 {
            return Err(PipelineError::config("min_batch_size must be positive"));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(PipelineError::config(format!(
                "min_batch_size {} exceeds max_batch_size {}",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if !(self.min_batch_size..=self.max_batch_size).contains(&self.initial_batch_size) {
            return Err(PipelineError::config(format!(
                "initial_batch_size {} outside [{}, {}]",
                self.initial_batch_size, self.min_batch_size, self.max_batch_size
            )));
        }
        if self.target_duration.is_zero() {
            return Err(PipelineError::config("target_duration must be positive"));
        }
        if !(self.adjustment_factor > 0.0 && self.adjustment_factor < 1.0) {
            return Err(PipelineError::config(
                "adjustment_factor must be strictly between 0 and 1",
            ));
        }
        Ok(())
    }
}

/// Everything a deployment configures, loadable from one TOML file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub limiter: LimiterConfig,
    pub pipeline: PipelineConfig,
    pub batch: BatchConfig,
    pub adaptive: AdaptiveConfig,
    pub logging: LogConfig,
}

impl ThrottleConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        self.pipeline.validate()?;
        self.batch.validate()?;
        self.adaptive.validate()
    }

    /// Apply `THROTTLE_*` environment variables.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(rate) = parse("THROTTLE_RATE").and_then(|v| u32::try_from(v).ok()) {
            self.limiter.rate = rate;
        }
        if let Some(per) = lookup("THROTTLE_PER_SECS")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(|v| Duration::try_from_secs_f64(v).ok())
        {
            self.limiter.per = per;
        }
        if let Some(burst) = parse("THROTTLE_BURST").and_then(|v| u32::try_from(v).ok()) {
            self.limiter.burst = Some(burst);
        }
        if let Some(size) = parse("THROTTLE_MAX_QUEUE_SIZE") {
            self.pipeline.max_queue_size = size as usize;
        }
        if let Some(n) = parse("THROTTLE_NUM_CONSUMERS") {
            self.pipeline.num_consumers = n as usize;
        }
        if let Some(size) = parse("THROTTLE_BATCH_SIZE") {
            self.batch.batch_size = size as usize;
        }
        if let Some(n) = parse("THROTTLE_MAX_CONCURRENT_BATCHES") {
            self.batch.max_concurrent_batches = n as usize;
        }
        if let Some(level) = lookup("THROTTLE_LOG_LEVEL") {
            self.logging.level = level;
        }
        self
    }
}
