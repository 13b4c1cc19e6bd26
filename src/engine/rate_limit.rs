use std::time::Duration;

use parking_lot::Mutex;
use size::Size;
use tokio::sync::Notify;

/// Token bucket shared by every connection of the engine.
///
/// Tokens are bytes. The bucket holds at most one second worth of traffic and is refilled by
/// the engine ticker through `replenish`. A rate of zero disables the limit.
pub struct RateLimiter {
    rate: u64,
    bucket: Mutex<Bucket>,
    notify: Notify,
}

struct Bucket {
    tokens: u64,
    capacity: u64,
    /// Part of a token earned by earlier ticks
    fraction: f64,
}

impl RateLimiter {
    pub fn new(rate: Size) -> Self {
        let rate = rate.bytes().max(0) as u64;
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                capacity: rate,
                fraction: 0.0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Waits until `bytes` tokens were taken from the bucket. Large amounts are taken in
    /// several installments, so the bucket never goes negative.
    pub async fn acquire(&self, bytes: usize) {
        if self.is_unlimited() {
            return;
        }
        let mut remaining = bytes as u64;
        while remaining > 0 {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            remaining -= self.take(remaining);
            if remaining > 0 {
                notified.await;
            }
        }
    }

    /// Adds the tokens accumulated over `elapsed` and wakes waiting connections.
    pub fn replenish(&self, elapsed: Duration) {
        if self.is_unlimited() {
            return;
        }
        {
            let mut bucket = self.bucket.lock();
            let earned = self.rate as f64 * elapsed.as_secs_f64() + bucket.fraction;
            let added = earned.floor();
            bucket.tokens = bucket.tokens.saturating_add(added as u64);
            if bucket.tokens >= bucket.capacity {
                bucket.tokens = bucket.capacity;
                bucket.fraction = 0.0;
            } else {
                bucket.fraction = earned - added;
            }
        }
        self.notify.notify_waiters();
    }

    fn take(&self, wanted: u64) -> u64 {
        let mut bucket = self.bucket.lock();
        let taken = bucket.tokens.min(wanted);
        bucket.tokens -= taken;
        taken
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::{Instant, interval};

    use super::*;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::new(Size::from_bytes(0));

        limiter.acquire(usize::MAX).await;

        assert!(limiter.is_unlimited());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_available_immediately() {
        let limiter = RateLimiter::new(Size::from_bytes(1000));
        let start = Instant::now();

        limiter.acquire(1000).await;

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn bytes_never_exceed_burst_plus_rate() {
        let limiter = Arc::new(RateLimiter::new(Size::from_bytes(1000)));
        let replenisher = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let mut ticks = interval(Duration::from_millis(100));
                ticks.tick().await;
                loop {
                    ticks.tick().await;
                    limiter.replenish(Duration::from_millis(100));
                }
            })
        };

        let start = Instant::now();
        for _ in 0..6 {
            limiter.acquire(500).await;
        }
        let elapsed = start.elapsed();

        // 3000 bytes at 1000 B/s with a 1000 byte burst
        assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(2100), "elapsed {:?}", elapsed);
        replenisher.abort();
    }

    #[test]
    fn slow_rates_accumulate_across_ticks() {
        for rate in [5, 15] {
            let limiter = RateLimiter::new(Size::from_bytes(rate));
            assert_eq!(limiter.take(u64::MAX), rate as u64);

            for _ in 0..10 {
                limiter.replenish(Duration::from_millis(100));
            }

            assert_eq!(limiter.take(u64::MAX), rate as u64);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn large_acquire_is_split_into_installments() {
        let limiter = Arc::new(RateLimiter::new(Size::from_bytes(100)));
        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(250).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        limiter.replenish(Duration::from_secs(1));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        limiter.replenish(Duration::from_secs(1));
        waiter.await.unwrap();
    }
}
