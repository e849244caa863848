//! Token bucket pacing for rate-limited senders.
//!
//! Tokens are bytes. The bucket refills at the target rate up to a capacity of
//! 100 ms worth of data (at least 8 KiB) and senders wait whenever a block
//! would overdraw it.

use std::time::Duration;
use tokio::time::{self, Instant};

const MIN_CAPACITY: u64 = 8 * 1024;

/// Byte-granular token bucket.
///
/// ```
/// use riperf::token_bucket::TokenBucket;
///
/// # async fn example() {
/// // 100 Mbit/s
/// let mut bucket = TokenBucket::new(12_500_000);
/// bucket.consume(1460).await;
/// # }
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    bytes_per_sec: u64,
    capacity: u64,
    /// May go negative: a block larger than the balance is allowed through
    /// once the wait for the deficit is over.
    tokens: i64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        let bytes_per_sec = bytes_per_sec.max(1);
        let capacity = (bytes_per_sec / 10).max(MIN_CAPACITY);
        Self {
            bytes_per_sec,
            capacity,
            tokens: capacity as i64,
            last_refill: Instant::now(),
        }
    }

    /// Waits until `bytes` may be sent, then debits them.
    pub async fn consume(&mut self, bytes: usize) {
        if let Some(wait) = self.take(bytes, Instant::now()) {
            time::sleep(wait).await;
        }
    }

    /// Debits `bytes` at time `now` and returns how long the caller must wait
    /// before sending, if at all.
    pub fn take(&mut self, bytes: usize, now: Instant) -> Option<Duration> {
        self.refill(now);
        self.tokens -= bytes as i64;
        if self.tokens >= 0 {
            return None;
        }
        let deficit = self.tokens.unsigned_abs();
        let nanos = deficit as u128 * 1_000_000_000 / self.bytes_per_sec as u128;
        Some(Duration::from_nanos(nanos.min(u64::MAX as u128) as u64))
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_micros() * self.bytes_per_sec as u128 / 1_000_000;
        if earned == 0 {
            return;
        }
        let earned = earned.min(i64::MAX as u128) as i64;
        self.tokens = self.tokens.saturating_add(earned).min(self.capacity as i64);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity() {
        assert_eq!(TokenBucket::new(10_000_000).capacity, 1_000_000);
        assert_eq!(TokenBucket::new(1000).capacity, MIN_CAPACITY);
    }

    #[test]
    fn test_take_within_balance_does_not_wait() {
        let mut bucket = TokenBucket::new(1_000_000);
        let now = bucket.last_refill;
        assert_eq!(bucket.take(1500, now), None);
        assert_eq!(bucket.tokens, 100_000 - 1500);
    }

    #[test]
    fn test_overdraw_waits_for_deficit() {
        let mut bucket = TokenBucket::new(1_000_000);
        let now = bucket.last_refill;
        let wait = bucket.take(100_000 + 10_000, now).unwrap();
        assert_eq!(wait, Duration::from_millis(10));
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let mut bucket = TokenBucket::new(1_000_000);
        let start = bucket.last_refill;
        bucket.take(50_000, start);
        bucket.take(0, start + Duration::from_secs(5));
        assert_eq!(bucket.tokens, bucket.capacity as i64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_paces_to_rate() {
        let mut bucket = TokenBucket::new(100_000);
        let start = Instant::now();
        for _ in 0..30 {
            bucket.consume(1000).await;
        }
        // 10 KB burst allowance, 20 KB more at 100 KB/s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(190), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(260), "{:?}", elapsed);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_releases_more_than_rate_allows(
                rate in 10_000u64..50_000_000,
                blocks in proptest::collection::vec(1usize..65_536, 1..50),
            ) {
                let mut bucket = TokenBucket::new(rate);
                let start = bucket.last_refill;
                let mut clock = start;
                let mut released = 0u64;
                for block in blocks {
                    if let Some(wait) = bucket.take(block, clock) {
                        clock += wait;
                    }
                    released += block as u64;
                    let elapsed = clock.duration_since(start).as_secs_f64();
                    let allowance = bucket.capacity as f64 + rate as f64 * elapsed;
                    prop_assert!(released as f64 <= allowance + 1.0 + rate as f64 * 1e-6);
                }
            }
        }
    }
}
