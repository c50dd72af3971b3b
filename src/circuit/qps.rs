use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

/// Token-bucket rate limiter for per-namespace client QPS.
///
/// `try_acquire` never blocks; a drained bucket is simply reported to the
/// caller, which decides between rejecting the statement and tearing the
/// session down (transactions cannot be resumed after a rejection).
pub struct QpsLimiter {
    /// Sustained tokens per second; also the burst size
    rate: u32,
    state: Mutex<BucketState>,
    rejected: AtomicUsize,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl QpsLimiter {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate as f64,
                last_refill: Instant::now(),
            }),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        if self.rate == 0 {
            return true;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            drop(state);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(rate = self.rate, "qps bucket drained");
            false
        }
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn drain(&self) {
        self.state.lock().tokens = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_always_allows() {
        let limiter = QpsLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.try_acquire());
        }
        assert_eq!(limiter.rejected_count(), 0);
    }

    #[test]
    fn burst_is_bounded_by_rate() {
        let limiter = QpsLimiter::new(5);
        let mut granted = 0;
        for _ in 0..10 {
            if limiter.try_acquire() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        assert_eq!(limiter.rejected_count(), 5);
    }

    #[test]
    fn drained_bucket_rejects_until_refill() {
        let limiter = QpsLimiter::new(100);
        limiter.drain();
        assert!(!limiter.try_acquire());

        std::thread::sleep(std::time::Duration::from_millis(50));
        // ~5 tokens refilled at 100/s
        assert!(limiter.try_acquire());
    }
}
