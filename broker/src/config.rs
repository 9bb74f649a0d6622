use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PREFETCH: usize = 10;
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DELIVER_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_QUEUE_LEN: usize = 10_000;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_SETTLED_HISTORY: usize = 1024;
const DEFAULT_DEAD_LETTER_CAPACITY: usize = 10_000;
const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// Broker tuning knobs.
///
/// Every field has a default; use the `with_*` methods to override them:
///
/// ```
/// use std::time::Duration;
/// use topic_broker::BrokerConfig;
///
/// let config = BrokerConfig::default()
///     .with_max_attempts(3)
///     .with_visibility_timeout(Duration::from_secs(10));
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Deliveries per entry before it is dead-lettered
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a delivered entry may stay unsettled before it counts as failed
    pub visibility_timeout: Duration,
    /// Concurrent handler invocations per subscription
    pub prefetch: usize,
    /// How long `publish` waits for queue space before giving up
    pub publish_timeout: Duration,
    /// How long a consumer waits for the broker to accept an ack/nack
    pub ack_timeout: Duration,
    /// Long-poll duration of a single consumer `deliver` call
    pub deliver_wait: Duration,
    pub max_queue_len: usize,
    pub sweep_interval: Duration,
    /// Settled message ids remembered per queue, for idempotent acks
    pub settled_history: usize,
    pub dead_letter_capacity: usize,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            prefetch: DEFAULT_PREFETCH,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            deliver_wait: DEFAULT_DELIVER_WAIT,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            settled_history: DEFAULT_SETTLED_HISTORY,
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
            snapshot_path: None,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

impl BrokerConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max.max(base);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_deliver_wait(mut self, wait: Duration) -> Self {
        self.deliver_wait = wait;
        self
    }

    pub fn with_max_queue_len(mut self, len: usize) -> Self {
        self.max_queue_len = len.max(1);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_settled_history(mut self, len: usize) -> Self {
        self.settled_history = len;
        self
    }

    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity.max(1);
        self
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>, interval: Duration) -> Self {
        self.snapshot_path = Some(path.into());
        self.snapshot_interval = interval;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based):
    /// `min(base_backoff * 2^(attempt - 1), max_backoff)`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
