use crate::error::{PipelineError, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Watermark-based soft backpressure.
///
/// When queue utilization reaches the high watermark the producer is asked
/// to pause briefly before each submission, ahead of the hard block that a
/// full queue imposes. The signal stays on until utilization falls to the
/// low watermark.
#[derive(Debug)]
pub struct BackpressureController {
    /// Percentage at which throttling starts
    high_watermark: u32,
    /// Percentage at which throttling stops
    low_watermark: u32,
    /// Pause before a throttled submission; doubles on consecutive throttles
    base_delay: Duration,
    max_delay: Duration,
    is_active: AtomicBool,
    streak: AtomicU32,
}

impl BackpressureController {
    /// Default: high=80%, low=50%, 5ms pause growing to at most 40ms
    pub fn new() -> Self {
        Self {
            high_watermark: 80,
            low_watermark: 50,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            is_active: AtomicBool::new(false),
            streak: AtomicU32::new(0),
        }
    }

    /// Custom watermark thresholds. `low` may not exceed `high`.
    pub fn with_watermarks(high: u32, low: u32) -> Result<Self> {
        let high = high.min(100);
        let low = low.min(100);
        if low > high {
            return Err(PipelineError::config(format!(
                "low watermark {low}% exceeds high watermark {high}%"
            )));
        }
        Ok(Self {
            high_watermark: high,
            low_watermark: low,
            ..Self::new()
        })
    }

    /// Set the pause applied per throttled submission and its ceiling.
    pub fn with_delay(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max.max(base);
        self
    }

    /// Feed the current utilization (0-100) and return whether throttling
    /// is now active.
    pub fn check_and_update(&self, utilization: u32) -> bool {
        let was_active = self.is_active.load(Ordering::Relaxed);

        let is_now_active = if was_active {
            utilization > self.low_watermark
        } else {
            utilization >= self.high_watermark
        };

        if is_now_active != was_active {
            self.is_active.store(is_now_active, Ordering::Relaxed);
            if !is_now_active {
                self.streak.store(0, Ordering::Relaxed);
            }
        }

        is_now_active
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }

    /// Pause for the current throttle delay if backpressure is active.
    /// Returns whether a pause happened.
    pub async fn throttle(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let delay = self.current_delay();
        self.streak.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(delay).await;
        true
    }

    /// Exponential backoff with cap
    pub fn current_delay(&self) -> Duration {
        let streak = self.streak.load(Ordering::Relaxed).min(10);
        self.base_delay
            .saturating_mul(1u32 << streak)
            .min(self.max_delay)
    }

    pub fn high_watermark(&self) -> u32 {
        self.high_watermark
    }

    pub fn low_watermark(&self) -> u32 {
        self.low_watermark
    }

    pub fn reset(&self) {
        self.is_active.store(false, Ordering::Relaxed);
        self.streak.store(0, Ordering::Relaxed);
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new()
    }
}
