//! Token-bucket rate limiting.
//!
//! One bucket is shared per direction at the client level. Connection
//! tasks call [`RateLimiter::acquire`] before writing received chunks to
//! storage (download) or before emitting a `Piece` (upload); when the
//! bucket is empty the task suspends on the limiter, not on the socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Shared token-bucket limiter. Cloning shares the bucket.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<Mutex<Bucket>>>,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    fill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.fill_rate).min(self.capacity);
    }
}

impl RateLimiter {
    /// A limiter filling at `rate` bytes/sec with one second of burst.
    pub fn new(rate: u64) -> Self {
        let rate = rate as f64;
        Self {
            inner: Some(Arc::new(Mutex::new(Bucket {
                tokens: rate,
                capacity: rate,
                fill_rate: rate,
                last_refill: Instant::now(),
            }))),
        }
    }

    /// A limiter that never blocks.
    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    /// Build from an optional bytes/sec cap.
    pub fn from_limit(limit: Option<u64>) -> Self {
        match limit {
            Some(rate) if rate > 0 => Self::new(rate),
            _ => Self::unlimited(),
        }
    }

    /// Consume `n` bytes of budget, sleeping until available.
    pub async fn acquire(&self, n: usize) {
        let Some(inner) = &self.inner else {
            return;
        };
        let n = n as f64;

        // An over-capacity request can never be satisfied from a full
        // bucket; charge it as pure delay instead.
        {
            let bucket = inner.lock().await;
            if n > bucket.capacity {
                let wait = Duration::from_secs_f64(n / bucket.fill_rate);
                drop(bucket);
                tokio::time::sleep(wait).await;
                return;
            }
        }

        loop {
            let wait = {
                let mut bucket = inner.lock().await;
                bucket.refill();
                if bucket.tokens >= n {
                    bucket.tokens -= n;
                    return;
                }
                let deficit = n - bucket.tokens;
                Duration::from_secs_f64((deficit / bucket.fill_rate).max(0.001))
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Whether a cap is configured.
    pub fn is_limited(&self) -> bool {
        self.inner.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(1 << 20).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn burst_then_throttle() {
        let limiter = RateLimiter::new(16 * 1024);
        // First acquisition drains the initial burst without waiting.
        let start = Instant::now();
        limiter.acquire(16 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(100));

        // The next full-bucket acquire must wait for refill.
        let start = Instant::now();
        limiter.acquire(8 * 1024).await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn shared_across_clones() {
        let limiter = RateLimiter::new(32 * 1024);
        let other = limiter.clone();
        limiter.acquire(32 * 1024).await;

        let start = Instant::now();
        other.acquire(4 * 1024).await;
        // The clone sees the drained bucket.
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
