/// Error types for broker operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Malformed routing key, rejected before anything is enqueued
    #[error("Invalid routing key '{key}': {reason}")]
    InvalidRoutingKey { key: String, reason: String },
    /// Malformed binding pattern
    #[error("Invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    /// Broker is shut down or did not accept the operation in time.
    ///
    /// Transient from the caller's point of view: retrying later may succeed.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),
    /// Queue was never declared or has been deleted
    #[error("Not registered queue: {0}")]
    UnknownQueue(String),
    /// Subscription id is not bound
    #[error("Not registered subscription: {0}")]
    UnknownSubscription(String),
    /// Queue reached its configured length
    #[error("Queue {0} is full")]
    QueueFull(String),
    /// Payload could not be serialized before publishing
    #[error("Error while serializing payload: {0}")]
    Serialization(String),
    /// Reading or writing the persisted broker state failed
    #[error("Error while persisting broker state: {0}")]
    Snapshot(String),
}

impl BrokerError {
    /// Whether the caller can expect a retry of the same call to succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_) | Self::QueueFull(_))
    }
}

/// Type alias for Result with BrokerError
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Failure raised by a delivery handler.
///
/// The consumer maps it to a requeueing nack, so the delivery is retried until the queue's
/// attempt budget is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Handler failure: {0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("payload could not be decoded: {err}"))
    }
}
