use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use topic_broker::BrokerResult;
use tracing::warn;

/// Producer-side retry: exponential backoff with full jitter.
///
/// Only transient broker errors (`BrokerUnavailable`, `QueueFull`) are retried; anything else is
/// returned on the first failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first call included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Upper bound of the sleep after failed attempt `attempt` (1-based)
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Random delay in `[0, ceiling_for(attempt)]`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for(attempt).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    pub async fn run<T, F, Fut>(&self, mut operation: F) -> BrokerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!("attempt {} failed: {}, retrying in {:?}", attempt, err, delay);
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
