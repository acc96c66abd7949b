use super::{LimiterStatistics, RateLimiter};
use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct LeakState {
    level: f64,
    last_leak: Instant,
    allowed: u64,
    rejected: u64,
    total_wait: Duration,
}

/// Leaky bucket: work raises the water level, which drains at `leak_rate`
/// units per second. Additions that would overflow `capacity` are refused.
pub struct LeakyBucket {
    capacity: f64,
    leak_rate: f64,
    state: Mutex<LeakState>,
}

impl LeakyBucket {
    /// Create an empty bucket.
    pub fn new(capacity: f64, leak_rate: f64) -> Result<Self> {
        // every admission pours one unit, so a smaller bucket never admits
        if !capacity.is_finite() || capacity < 1.0 {
            return Err(PipelineError::config("leaky bucket capacity must be at least 1"));
        }
        if !leak_rate.is_finite() || leak_rate <= 0.0 {
            return Err(PipelineError::config("leaky bucket leak rate must be positive"));
        }
        Ok(Self {
            capacity,
            leak_rate,
            state: Mutex::new(LeakState {
                level: 0.0,
                last_leak: Instant::now(),
                allowed: 0,
                rejected: 0,
                total_wait: Duration::ZERO,
            }),
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn leak_rate(&self) -> f64 {
        self.leak_rate
    }

    fn leak(&self, state: &mut LeakState, now: Instant) {
        if now > state.last_leak {
            let elapsed = now.duration_since(state.last_leak).as_secs_f64();
            state.level = (state.level - elapsed * self.leak_rate).max(0.0);
            state.last_leak = now;
        }
    }

    /// Pour `amount` into the bucket if it fits.
    pub fn add(&self, amount: f64) -> bool {
        self.add_at(amount, Instant::now())
    }

    /// [`add`](Self::add) against an explicit clock reading.
    pub fn add_at(&self, amount: f64, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.leak(&mut state, now);
        if amount >= 0.0 && state.level + amount <= self.capacity {
            state.level += amount;
            state.allowed += 1;
            true
        } else {
            state.rejected += 1;
            false
        }
    }

    /// Water level at `now`.
    pub fn level_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.leak(&mut state, now);
        state.level
    }

    pub fn level(&self) -> f64 {
        self.level_at(Instant::now())
    }
}

impl RateLimiter for LeakyBucket {
    fn poll_admission(&self, now: Instant, waited: Duration) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        self.leak(&mut state, now);
        if state.level + 1.0 <= self.capacity {
            state.level += 1.0;
            state.allowed += 1;
            state.total_wait += waited;
            Ok(())
        } else {
            let overflow = state.level + 1.0 - self.capacity;
            Err(Duration::from_secs_f64(overflow / self.leak_rate))
        }
    }

    fn record_rejection(&self) {
        self.state.lock().rejected += 1;
    }

    fn statistics(&self) -> LimiterStatistics {
        let mut state = self.state.lock();
        self.leak(&mut state, Instant::now());
        LimiterStatistics {
            allowed: state.allowed,
            rejected: state.rejected,
            rejection_rate: LimiterStatistics::rejection_rate(state.allowed, state.rejected),
            current_rate: state.level.ceil() as usize,
            available: (self.capacity - state.level).max(0.0).floor() as usize,
            total_wait_time: state.total_wait,
        }
    }
}

impl fmt::Debug for LeakyBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("capacity", &self.capacity)
            .field("leak_rate", &self.leak_rate)
            .finish_non_exhaustive()
    }
}
