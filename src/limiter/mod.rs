//! Rate limiters.
//!
//! Three variants share the [`RateLimiter`] trait:
//!
//! | Variant | Admits | Typical use |
//! |---------|--------|-------------|
//! | [`SlidingWindowLimiter`] | at most `rate` events in any trailing `per` window | politeness toward a single host |
//! | [`TokenBucket`] | bursts up to `capacity`, refilled at `refill_rate`/s | bursty clients with an average budget |
//! | [`LeakyBucket`] | while the level stays under `capacity`, draining at `leak_rate`/s | smoothing a bursty producer |
//!
//! None of them run background timers: refill, leak and window trimming are
//! computed lazily from elapsed time whenever the limiter is touched. Each
//! limiter guards its state with a single mutex which is never held across an
//! `.await`, so every waiting method is cancel-safe.
//!
//! ```rust
//! use throttled_pipeline::limiter::{RateLimiter, SlidingWindowLimiter};
//! use std::time::Duration;
//!
//! let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(1)).unwrap();
//! assert!(limiter.try_acquire());
//! assert!(limiter.try_acquire());
//! assert!(!limiter.try_acquire());
//! assert_eq!(limiter.statistics().rejected, 1);
//! ```

mod leaky_bucket;
mod sliding_window;
mod token_bucket;

pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucket;

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Smallest sleep used while waiting for capacity.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Outcome of a deadline-bounded acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Capacity could not be obtained before the deadline.
    TimedOut,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Point-in-time view of a limiter's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimiterStatistics {
    pub allowed: u64,
    pub rejected: u64,
    /// `rejected / (allowed + rejected)`, 0 when nothing was attempted.
    pub rejection_rate: f64,
    /// Permits currently held against the limit.
    pub current_rate: usize,
    /// Permits that could be granted right now.
    pub available: usize,
    /// Time spent suspended in `acquire` by admitted callers.
    pub total_wait_time: Duration,
}

impl LimiterStatistics {
    pub(crate) fn rejection_rate(allowed: u64, rejected: u64) -> f64 {
        let total = allowed + rejected;
        if total == 0 {
            0.0
        } else {
            rejected as f64 / total as f64
        }
    }
}

/// Common admission contract.
///
/// Implementors provide [`poll_admission`](RateLimiter::poll_admission); the
/// waiting variants are built on top of it and re-check under the lock after
/// every wake-up, so concurrent waiters never double-admit.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to claim one permit at `now`.
    ///
    /// On success the admission is counted and `waited` is added to the total
    /// wait time. On refusal returns the earliest time at which a retry could
    /// succeed; refusals are not counted here.
    fn poll_admission(&self, now: Instant, waited: Duration) -> Result<(), Duration>;

    /// Count one rejected attempt.
    fn record_rejection(&self);

    /// Snapshot of the counters, brought up to date first.
    fn statistics(&self) -> LimiterStatistics;

    /// Claim a permit without waiting. Rejections do not consume capacity.
    fn try_acquire(&self) -> bool {
        match self.poll_admission(Instant::now(), Duration::ZERO) {
            Ok(()) => true,
            Err(_) => {
                self.record_rejection();
                false
            }
        }
    }

    /// Suspend until a permit is granted.
    async fn acquire(&self) {
        let started = Instant::now();
        loop {
            let now = Instant::now();
            match self.poll_admission(now, now.saturating_duration_since(started)) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait.max(MIN_WAIT)).await,
            }
        }
    }

    /// Suspend until a permit is granted or `deadline` passes.
    ///
    /// Gives up early when the next possible admission already lies beyond
    /// the deadline. A timeout counts as a rejection.
    async fn acquire_until(&self, deadline: Instant) -> Admission {
        let started = Instant::now();
        loop {
            let now = Instant::now();
            match self.poll_admission(now, now.saturating_duration_since(started)) {
                Ok(()) => return Admission::Admitted,
                Err(wait) => {
                    let wait = wait.max(MIN_WAIT);
                    if now + wait > deadline {
                        self.record_rejection();
                        return Admission::TimedOut;
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
