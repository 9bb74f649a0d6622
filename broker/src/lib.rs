//! In-process topic broker.
//!
//! Producers publish events to an exchange under a dot-separated routing key; consumers bind
//! AMQP-style topic patterns (`*` = one segment, `#` = zero or more) and receive matching events
//! through per-subscription queues with at-least-once delivery, exponential-backoff redelivery and
//! a dead letter sink.
//!
//! ```no_run
//! use std::sync::Arc;
//! use topic_broker::{Broker, BrokerConfig, Consumer, EventConsumer, EventPublisher, Outcome, Publisher, handler_fn};
//!
//! # async fn run() -> Result<(), topic_broker::BrokerError> {
//! let broker = Broker::start(BrokerConfig::default()).await?;
//!
//! let consumer = Consumer::new(broker.clone(), "product.exchange");
//! consumer
//!     .subscribe("product.*", Arc::new(handler_fn(|delivery| async move {
//!         println!("{}", String::from_utf8_lossy(&delivery.payload));
//!         Ok(Outcome::Ack)
//!     })))
//!     .await?;
//!
//! let publisher = Publisher::new(broker.clone(), "catalog");
//! publisher.publish("product.exchange", "product.created", "Widget".into()).await?;
//!
//! consumer.shutdown().await;
//! broker.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod broker;
mod config;
mod consumer;
mod dead_letter;
mod error;
mod publisher;
mod queue;
mod router;
mod snapshot;
mod types;

pub use broker::{Broker, BrokerBuilder};
pub use config::BrokerConfig;
pub use consumer::{Consumer, DeliveryHandler, EventConsumer, FnHandler, Outcome, SubscribeOptions, handler_fn};
pub use dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterSink};
pub use error::{BrokerError, BrokerResult, HandlerError};
pub use publisher::{EventPublisher, Message, Publisher};
pub use queue::{AckOutcome, NackOutcome, QueueStats};
pub use router::{RoutingKey, TopicPattern, TopicRouter};
pub use snapshot::{BrokerSnapshot, QueueRecord, SnapshotStore};
pub use types::{Delivery, DeliveryState, Event, MessageId, QueueEntry, QueueId, Subscription, SubscriptionId};
