//! Token-bucket gate for the vision model quota.
//!
//! Backed by a `governor` GCRA limiter with a burst of one cell, which is a
//! token bucket of capacity one: calls are spaced at least `1 / rate` apart
//! and never burst. The limiter reads tokio's clock, so paused test time
//! drives it. Waiters queue on a single async mutex held across the deficit
//! sleep, so they are granted in FIFO order and at most one is ever polling
//! the bucket.

use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::retry::Cancelled;

/// Quota tier of the vision model account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateTier {
    #[default]
    Free,
    Paid,
}

impl RateTier {
    pub fn requests_per_minute(&self) -> u32 {
        match self {
            RateTier::Free => 15,
            RateTier::Paid => 1000,
        }
    }
}

impl std::str::FromStr for RateTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(RateTier::Free),
            "paid" => Ok(RateTier::Paid),
            other => Err(format!("unknown rate tier '{}' (expected free or paid)", other)),
        }
    }
}

/// `governor` clock over tokio time, measured from the limiter's creation.
#[derive(Debug, Clone)]
struct TokioClock {
    origin: Instant,
}

impl Clock for TokioClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(self.origin.elapsed())
    }
}

type Gcra = governor::RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<Nanos>>;

/// Process-wide limiter shared by every stage through an `Arc`.
pub struct RateLimiter {
    /// Tokens per second.
    rate: f64,
    interval: Duration,
    clock: TokioClock,
    bucket: Gcra,
    queue: Mutex<()>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates a limiter allowing `requests_per_minute` calls.
    ///
    /// The bucket starts full so the first call is never delayed.
    pub fn new(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        let interval = Duration::from_nanos(60_000_000_000 / u64::from(rpm));
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        let clock = TokioClock {
            origin: Instant::now(),
        };
        Self {
            rate: f64::from(rpm) / 60.0,
            interval,
            bucket: governor::RateLimiter::direct_with_clock(quota, clock.clone()),
            clock,
            queue: Mutex::new(()),
        }
    }

    pub fn for_tier(tier: RateTier) -> Self {
        Self::new(tier.requests_per_minute())
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Minimum spacing between two granted tokens.
    pub fn min_interval(&self) -> Duration {
        self.interval
    }

    /// Blocks until a token is available, then consumes it.
    pub async fn wait_for_token(&self) {
        let _turn = self.queue.lock().await;
        loop {
            match self.bucket.check() {
                Ok(()) => return,
                Err(not_until) => {
                    let deficit = not_until.wait_time_from(self.clock.now());
                    tracing::trace!(wait_ms = deficit.as_millis() as u64, "Rate limiter waiting");
                    tokio::time::sleep(deficit).await;
                }
            }
        }
    }

    /// Like [`wait_for_token`](Self::wait_for_token) but gives up when
    /// `cancel` fires. A cancelled wait consumes nothing.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            _ = self.wait_for_token() => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_tier_rates() {
        assert_eq!(RateTier::Free.requests_per_minute(), 15);
        assert_eq!(RateTier::Paid.requests_per_minute(), 1000);
        assert_eq!("PAID".parse::<RateTier>(), Ok(RateTier::Paid));
        assert!("gold".parse::<RateTier>().is_err());
    }

    #[test]
    fn test_min_interval() {
        let limiter = RateLimiter::new(60);
        assert!((limiter.rate() - 1.0).abs() < f64::EPSILON);
        assert_eq!(limiter.min_interval(), Duration::from_secs(1));
        assert_eq!(RateLimiter::new(1000).min_interval(), Duration::from_millis(60));
        assert_eq!(RateLimiter::new(0).min_interval(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_token_is_immediate() {
        let limiter = RateLimiter::new(15);
        let start = Instant::now();
        limiter.wait_for_token().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_tokens_are_spaced() {
        // 120 rpm = 2 tokens per second
        let limiter = RateLimiter::new(120);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.wait_for_token().await;
        }
        // first is free, the other four wait 0.5s each
        assert!(start.elapsed() >= Duration::from_millis(2000));
        assert!(start.elapsed() < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_bound_under_concurrency() {
        let limiter = Arc::new(RateLimiter::new(600)); // 10 per second
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.wait_for_token().await;
                Instant::now()
            }));
        }

        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.expect("task should not panic"));
        }
        grants.sort();

        let rate = limiter.rate();
        for (i, first) in grants.iter().enumerate() {
            for (j, last) in grants.iter().enumerate().skip(i) {
                let window = last.duration_since(*first).as_secs_f64();
                let granted = (j - i + 1) as f64;
                assert!(
                    granted <= (window * rate + 1e-6).ceil() + 1.0,
                    "{} grants in {:.3}s window",
                    granted,
                    window
                );
            }
        }
        assert!(start.elapsed() >= Duration::from_millis(1900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_consumes_nothing() {
        let limiter = RateLimiter::new(60);
        limiter.wait_for_token().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(limiter.acquire(&cancel).await, Err(Cancelled));

        // the next token is still due one interval after the first grant
        tokio::time::advance(Duration::from_secs(1)).await;
        let start = Instant::now();
        limiter.wait_for_token().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_granted_in_order() {
        let limiter = Arc::new(RateLimiter::new(60));
        limiter.wait_for_token().await;

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter.wait_for_token().await;
                order.lock().unwrap().push(i);
            }));
            // let each waiter reach the queue before spawning the next
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
