use super::{LimiterStatistics, RateLimiter};
use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    allowed: u64,
    rejected: u64,
    total_wait: Duration,
}

/// Token bucket: holds up to `capacity` tokens, refilled continuously at
/// `refill_rate` tokens per second.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::config("token bucket capacity must be positive"));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(PipelineError::config(
                "token bucket refill rate must be a positive number",
            ));
        }
        Ok(Self {
            capacity: capacity as f64,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
                allowed: 0,
                rejected: 0,
                total_wait: Duration::ZERO,
            }),
        })
    }

    /// `rate` permits per `per`, bursting up to `burst` (default `rate`).
    pub fn per_period(rate: u32, per: Duration, burst: Option<u32>) -> Result<Self> {
        if per.is_zero() {
            return Err(PipelineError::config("token bucket period must be positive"));
        }
        Self::new(burst.unwrap_or(rate), rate as f64 / per.as_secs_f64())
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if now > state.last_refill {
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// Take `n` tokens if available. Never blocks.
    pub fn consume(&self, n: f64) -> bool {
        self.consume_at(n, Instant::now())
    }

    /// [`consume`](Self::consume) against an explicit clock reading.
    pub fn consume_at(&self, n: f64, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if n >= 0.0 && state.tokens >= n {
            state.tokens -= n;
            state.allowed += 1;
            true
        } else {
            state.rejected += 1;
            false
        }
    }

    /// Tokens available at `now`.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    pub fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }
}

impl RateLimiter for TokenBucket {
    fn poll_admission(&self, now: Instant, waited: Duration) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.allowed += 1;
            state.total_wait += waited;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }

    fn record_rejection(&self) {
        self.state.lock().rejected += 1;
    }

    fn statistics(&self) -> LimiterStatistics {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        let available = state.tokens.floor() as usize;
        LimiterStatistics {
            allowed: state.allowed,
            rejected: state.rejected,
            rejection_rate: LimiterStatistics::rejection_rate(state.allowed, state.rejected),
            current_rate: (self.capacity as usize).saturating_sub(available),
            available,
            total_wait_time: state.total_wait,
        }
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish_non_exhaustive()
    }
}
