//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                              | Key Methods     |
// |-----------------|----------------------------------------------------------|-----------------|
// | MessageId       | Unique id stamped on every published event               | new             |
// | QueueId         | Name of a queue inside the broker                        | new, as_str     |
// | SubscriptionId  | Id of a binding between a pattern and a queue            | generate        |
// | Event           | Immutable published message                              | new             |
// | Subscription    | Pattern + queue binding, optionally part of a group      | new, in_group   |
// | DeliveryState   | Lifecycle state of a queue entry                         | is_terminal     |
// | QueueEntry      | Event plus delivery bookkeeping for one queue            |                 |
// | Delivery        | What a consumer receives                                 |                 |
//--------------------------------------------------------------------------------------------------

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::router::{RoutingKey, TopicPattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueueId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a random, process-unique subscription id
    pub fn generate() -> Self {
        Self(format!("sub-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubscriptionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A published event.
///
/// Fields are private: once built, an event is never mutated. The broker clones it into every
/// matching queue, which is cheap because the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    message_id: MessageId,
    exchange: String,
    routing_key: RoutingKey,
    payload: Bytes,
    published_at: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with a fresh message id and the current time
    pub fn new(exchange: impl Into<String>, routing_key: RoutingKey, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: MessageId::new(),
            exchange: exchange.into(),
            routing_key,
            payload: payload.into(),
            published_at: Utc::now(),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }
}

/// Binding of a topic pattern on an exchange to a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub exchange: String,
    pub pattern: TopicPattern,
    pub queue_id: QueueId,
    pub consumer_group: Option<String>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        exchange: impl Into<String>,
        pattern: TopicPattern,
        queue_id: QueueId,
    ) -> Self {
        Self {
            id,
            exchange: exchange.into(),
            pattern,
            queue_id,
            consumer_group: None,
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }
}

/// Lifecycle of a queue entry.
///
/// `Pending -> Delivered -> Acked`, or `Pending -> Delivered -> Failed -> Pending` while attempts
/// remain, and finally `DeadLettered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Acked,
    Failed,
    DeadLettered,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::DeadLettered)
    }
}

/// One event as tracked by one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub event: Event,
    pub delivery_state: DeliveryState,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Event handed to a consumer, together with the bookkeeping it needs to ack or nack it
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue_id: QueueId,
    pub message_id: MessageId,
    pub exchange: String,
    pub routing_key: RoutingKey,
    pub payload: Bytes,
    pub published_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl Delivery {
    pub(crate) fn from_entry(queue_id: &QueueId, entry: &QueueEntry) -> Self {
        Self {
            queue_id: queue_id.clone(),
            message_id: entry.event.message_id(),
            exchange: entry.event.exchange().to_owned(),
            routing_key: entry.event.routing_key().clone(),
            payload: entry.event.payload().clone(),
            published_at: entry.event.published_at(),
            attempt_count: entry.attempt_count,
        }
    }
}
