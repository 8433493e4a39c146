//! Token-bucket throttle for legacy page fetches.
//!
//! One bucket is shared by every pipeline a worker runs, so the legacy
//! source sees a bounded request rate no matter how many jobs are active.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Token bucket. Each page fetch takes one token.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: AtomicU64,
    refill_rate: u64,
    refill_interval: Duration,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    /// Bucket holding `capacity` tokens, topped up by `refill_rate` every
    /// `refill_interval`. Starts full.
    pub fn new(capacity: u64, refill_rate: u64, refill_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tokens: AtomicU64::new(capacity),
            refill_rate: refill_rate.max(1),
            refill_interval,
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Allow `pages_per_second` fetches per second with a one-second burst.
    pub fn per_second(pages_per_second: u64) -> Self {
        let rate = pages_per_second.max(1);
        // Refill in tenths of a second so bursts stay small.
        Self::new(rate, rate.div_ceil(10), Duration::from_millis(100))
    }

    /// Allow `pages_per_minute` fetches per minute.
    pub fn per_minute(pages_per_minute: u64) -> Self {
        let rate = pages_per_minute.max(1);
        Self::new(rate, rate.div_ceil(60), Duration::from_secs(1))
    }

    pub async fn try_acquire(&self) -> bool {
        self.try_acquire_many(1).await
    }

    pub async fn try_acquire_many(&self, count: u64) -> bool {
        self.refill().await;

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current < count {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - count, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        while !self.try_acquire_many(1).await {
            tokio::time::sleep(self.refill_interval / 10).await;
        }
    }

    pub fn available(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    async fn refill(&self) {
        let mut last_refill = self.last_refill.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);
        if elapsed < self.refill_interval {
            return;
        }

        let intervals = (elapsed.as_secs_f64() / self.refill_interval.as_secs_f64()) as u64;
        let new_tokens = intervals.saturating_mul(self.refill_rate);
        if new_tokens == 0 {
            return;
        }
        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            let next = current.saturating_add(new_tokens).min(self.capacity);
            if self
                .tokens
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        *last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_drains_then_limits() {
        let bucket = TokenBucket::new(3, 1, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(bucket.try_acquire().await);
        }
        assert!(!bucket.try_acquire().await);
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test]
    async fn test_bucket_refills() {
        let bucket = TokenBucket::new(2, 2, Duration::from_millis(30));
        assert!(bucket.try_acquire_many(2).await);
        assert!(!bucket.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(bucket.try_acquire().await);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1, 1, Duration::from_millis(20));
        bucket.acquire().await;
        let started = Instant::now();
        bucket.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_per_second_shape() {
        let bucket = TokenBucket::per_second(50);
        assert_eq!(bucket.capacity, 50);
        assert_eq!(bucket.refill_rate, 5);
        assert_eq!(bucket.refill_interval, Duration::from_millis(100));
    }
}
