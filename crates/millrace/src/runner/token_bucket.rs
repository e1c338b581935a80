//! Token-bucket rate limiter for gating event dispatch.

use tokio::time::Instant;

/// Allows `rate` events per second on average while tolerating short
/// bursts. Virtual-time refill: tokens accrue on `acquire`, so an idle
/// runner burns no CPU on refill timers.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    tokens: f64,
    last_check: Instant,
}

impl TokenBucket {
    /// `rate` must be positive; it is floored at a small epsilon to keep
    /// the arithmetic sane.
    pub fn new(rate: f64) -> Self {
        let rate = rate.max(f64::EPSILON);
        Self {
            rate,
            tokens: rate,
            last_check: Instant::now(),
        }
    }

    /// Wait until a token is available and consume it.
    pub async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last_check).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
            self.last_check = now;
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let wait = (1.0 - self.tokens) / self.rate;
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_initial_burst_up_to_rate() {
        let mut bucket = TokenBucket::new(5.0);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        // The initial bucket is full, so five tokens cost ~nothing.
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttles_beyond_burst() {
        let mut bucket = TokenBucket::new(10.0);
        for _ in 0..10 {
            bucket.acquire().await;
        }
        let start = Instant::now();
        // Bucket empty: the next two tokens take ~200ms of virtual time.
        bucket.acquire().await;
        bucket.acquire().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "elapsed: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(400), "elapsed: {elapsed:?}");
    }
}
