use super::{LimiterStatistics, RateLimiter};
use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct WindowState {
    /// Admission timestamps inside the trailing window, oldest first.
    events: VecDeque<Instant>,
    allowed: u64,
    rejected: u64,
    total_wait: Duration,
}

/// Admits at most `rate` operations in any trailing `per` window.
pub struct SlidingWindowLimiter {
    rate: usize,
    per: Duration,
    state: Mutex<WindowState>,
}

impl SlidingWindowLimiter {
    pub fn new(rate: u32, per: Duration) -> Result<Self> {
        if rate == 0 {
            return Err(PipelineError::config("sliding window rate must be positive"));
        }
        if per.is_zero() {
            return Err(PipelineError::config("sliding window period must be positive"));
        }
        Ok(Self {
            rate: rate as usize,
            per,
            state: Mutex::new(WindowState {
                events: VecDeque::with_capacity(rate as usize),
                ..WindowState::default()
            }),
        })
    }

    pub fn rate(&self) -> usize {
        self.rate
    }

    pub fn per(&self) -> Duration {
        self.per
    }

    /// An event at `t` leaves the window once `now - t >= per`.
    fn trim(&self, state: &mut WindowState, now: Instant) {
        while let Some(&oldest) = state.events.front() {
            if now.saturating_duration_since(oldest) >= self.per {
                state.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Non-blocking admission against an explicit clock reading.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        match self.poll_admission(now, Duration::ZERO) {
            Ok(()) => true,
            Err(_) => {
                self.record_rejection();
                false
            }
        }
    }

    /// Statistics as of `now`.
    pub fn statistics_at(&self, now: Instant) -> LimiterStatistics {
        let mut state = self.state.lock();
        self.trim(&mut state, now);
        let current = state.events.len();
        LimiterStatistics {
            allowed: state.allowed,
            rejected: state.rejected,
            rejection_rate: LimiterStatistics::rejection_rate(state.allowed, state.rejected),
            current_rate: current,
            available: self.rate.saturating_sub(current),
            total_wait_time: state.total_wait,
        }
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn poll_admission(&self, now: Instant, waited: Duration) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        self.trim(&mut state, now);

        if state.events.len() < self.rate {
            state.events.push_back(now);
            state.allowed += 1;
            state.total_wait += waited;
            return Ok(());
        }

        // Full window: the next slot frees when the oldest event expires.
        let wait = state
            .events
            .front()
            .map(|&oldest| (oldest + self.per).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        Err(wait)
    }

    fn record_rejection(&self) {
        self.state.lock().rejected += 1;
    }

    fn statistics(&self) -> LimiterStatistics {
        self.statistics_at(Instant::now())
    }
}

impl fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("rate", &self.rate)
            .field("per", &self.per)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config() {
        assert!(SlidingWindowLimiter::new(0, Duration::from_secs(1)).is_err());
        assert!(SlidingWindowLimiter::new(5, Duration::ZERO).is_err());
    }

    #[test]
    fn test_rejects_when_window_full() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(1)).unwrap();
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_millis(500)));

        let stats = limiter.statistics_at(t0 + Duration::from_millis(500));
        assert_eq!(stats.allowed, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.current_rate, 3);
    }

    #[test]
    fn test_slot_frees_exactly_at_window_edge() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1)).unwrap();
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_millis(999)));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_rejections_do_not_consume_slots() {
        // Assumption: a refused try_acquire leaves the window untouched.
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(1)).unwrap();
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0));
        for i in 1..10 {
            assert!(!limiter.try_acquire_at(t0 + Duration::from_millis(i * 10)));
        }
        let stats = limiter.statistics_at(t0 + Duration::from_millis(100));
        assert_eq!(stats.current_rate, 2);
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_statistics_trim_before_reporting() {
        let limiter = SlidingWindowLimiter::new(4, Duration::from_secs(2)).unwrap();
        let t0 = Instant::now();
        for _ in 0..4 {
            assert!(limiter.try_acquire_at(t0));
        }
        let stats = limiter.statistics_at(t0 + Duration::from_secs(3));
        assert_eq!(stats.current_rate, 0);
        assert_eq!(stats.available, 4);
        assert_eq!(stats.allowed, 4);
        assert_eq!(stats.rejection_rate, 0.0);
    }

    #[test]
    fn test_poll_reports_wait_until_oldest_expires() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1)).unwrap();
        let t0 = Instant::now();
        assert!(limiter.poll_admission(t0, Duration::ZERO).is_ok());
        let wait = limiter
            .poll_admission(t0 + Duration::from_millis(300), Duration::ZERO)
            .unwrap_err();
        assert_eq!(wait, Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_window() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(1)).unwrap();
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        let stats = limiter.statistics();
        assert_eq!(stats.allowed, 3);
        assert!(stats.total_wait_time >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_until_times_out() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(10)).unwrap();
        limiter.acquire().await;
        let deadline = Instant::now() + Duration::from_secs(1);
        let outcome = limiter.acquire_until(deadline).await;
        assert_eq!(outcome, super::super::Admission::TimedOut);
        assert_eq!(limiter.statistics().rejected, 1);
    }
}
