//! Per-venue submission throttle.
//!
//! Token bucket sized from venue documentation, fronted by a bounded wait
//! queue. A submission that finds the bucket empty parks in the queue until
//! a token frees up; when the queue itself is full the caller gets
//! backpressure instead of unbounded latency.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Semaphore;

use super::AdapterError;

pub struct SubmitThrottle {
    limiter: DefaultDirectRateLimiter,
    queue: Semaphore,
    queue_len: usize,
}

impl SubmitThrottle {
    /// `requests_per_minute` sizes the bucket; `max_queue` bounds how many
    /// submissions may wait for a token.
    pub fn new(requests_per_minute: u32, max_queue: usize) -> Option<Self> {
        let rate = NonZeroU32::new(requests_per_minute)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_minute(rate)),
            queue: Semaphore::new(max_queue),
            queue_len: max_queue,
        })
    }

    /// Take one token, waiting in the bounded queue if necessary.
    pub async fn acquire(&self) -> Result<(), AdapterError> {
        if self.limiter.check().is_ok() {
            return Ok(());
        }

        let _slot = self
            .queue
            .try_acquire()
            .map_err(|_| AdapterError::Backpressure)?;
        self.limiter.until_ready().await;
        Ok(())
    }

    /// Non-waiting probe, used by health reporting.
    pub fn would_allow(&self) -> bool {
        self.limiter.check().is_ok() || self.queue.available_permits() > 0
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokens_then_queue_then_backpressure() {
        // One request per minute, no queue: second submit must be rejected.
        let throttle = SubmitThrottle::new(1, 0).unwrap();
        assert!(throttle.acquire().await.is_ok());
        assert!(matches!(
            throttle.acquire().await,
            Err(AdapterError::Backpressure)
        ));
    }

    #[tokio::test]
    async fn test_zero_rate_is_rejected_config() {
        assert!(SubmitThrottle::new(0, 4).is_none());
    }

    #[tokio::test]
    async fn test_burst_within_quota_passes() {
        let throttle = SubmitThrottle::new(600, 4).unwrap();
        for _ in 0..5 {
            assert!(throttle.acquire().await.is_ok());
        }
    }
}
