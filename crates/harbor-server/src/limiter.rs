//! Per-library rate limiting.
//!
//! One token bucket per library with a nonzero byte/second cap, shared by
//! every session bound to that library. Capacity equals one second of the
//! configured rate; refill is continuous. `consume` sleeps for the deficit
//! instead of failing, so chunk commands simply stretch out to the budget.
//! A rate of 0 disables the limiter.
//!
//! Callers run `consume` inside their cancellation select, which keeps the
//! sleep abortable on session termination; the bucket lock is never held
//! across the sleep.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Token-bucket byte limiter.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second; 0 = unbounded
    rate: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter for `rate` bytes/second (0 = unbounded).
    #[must_use]
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                available: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Whether this limiter admits everything immediately.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.rate == 0
    }

    /// Consume `n` bytes of budget, sleeping for any deficit.
    pub async fn consume(&self, n: u64) {
        if self.rate == 0 || n == 0 {
            return;
        }
        let rate = self.rate as f64;

        let deficit = {
            let mut bucket = self.bucket.lock().await;

            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.available = (bucket.available + elapsed * rate).min(rate);
            bucket.last_refill = now;

            let need = n as f64;
            if bucket.available >= need {
                bucket.available -= need;
                0.0
            } else {
                let deficit = need - bucket.available;
                bucket.available = 0.0;
                deficit
            }
        };

        if deficit > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(deficit / rate)).await;
        }
    }
}
