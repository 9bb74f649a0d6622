use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::router::RoutingKey;
use crate::types::{Event, MessageId};

/// Producer capability.
///
/// Implementations validate the routing key, stamp a message id and hand the event to a broker.
/// There is no retry at this level: a `BrokerUnavailable` error goes straight back to the caller.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> BrokerResult<MessageId>;
}

/// Publisher handle backed by an in-process [`Broker`].
///
/// Clone it freely: every clone publishes through the same broker.
#[derive(Clone)]
pub struct Publisher {
    broker: Broker,
    app_id: String,
}

impl Publisher {
    pub fn new(broker: Broker, app_id: &str) -> Self {
        Self {
            broker,
            app_id: app_id.to_owned(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Serializes `payload` as JSON and publishes it
    ///
    /// # Errors
    /// Returns `BrokerError::Serialization` before touching the broker if the payload cannot be
    /// serialized
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> BrokerResult<MessageId> {
        let body = serde_json::to_vec(payload).map_err(|err| BrokerError::Serialization(err.to_string()))?;
        self.publish(exchange, routing_key, Bytes::from(body)).await
    }

    /// Publishes a [`Message`] built with a topic
    ///
    /// # Errors
    /// Returns `BrokerError::InvalidRoutingKey` if the message carries no topic
    pub async fn send(&self, exchange: &str, message: Message) -> BrokerResult<MessageId> {
        let Some(topic) = message.topic else {
            return Err(BrokerError::InvalidRoutingKey {
                key: String::new(),
                reason: "message has no topic".to_owned(),
            });
        };
        self.publish(exchange, &topic, message.content).await
    }
}

#[async_trait]
impl EventPublisher for Publisher {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> BrokerResult<MessageId> {
        let routing_key = RoutingKey::parse(routing_key)?;
        let event = Event::new(exchange, routing_key, payload);

        debug!(
            "{} publishing message {} to {} with key {}",
            self.app_id,
            event.message_id(),
            exchange,
            event.routing_key()
        );
        self.broker.publish(event).await
    }
}

/// Message to be published
///
/// Holds the payload and the topic (routing key) it is published under. Set the topic with
/// [`Message::with_topic`].
#[derive(Debug, Clone)]
pub struct Message {
    content: Bytes,
    topic: Option<String>,
}

impl<T: AsRef<[u8]>> From<T> for Message {
    fn from(value: T) -> Self {
        Message {
            content: Bytes::copy_from_slice(value.as_ref()),
            topic: None,
        }
    }
}

impl Message {
    pub fn new(content: impl Into<Bytes>, topic: Option<String>) -> Self {
        Self {
            content: content.into(),
            topic,
        }
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Sets the routing key the message is published under
    pub fn with_topic(self, topic: &str) -> Self {
        Self {
            content: self.content,
            topic: Some(topic.to_owned()),
        }
    }
}
