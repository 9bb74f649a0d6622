use std::sync::Arc;

use async_trait::async_trait;
use topic_broker::{Delivery, DeliveryHandler, HandlerError, Outcome};
use tracing::{debug, warn};

use super::notifier::Notifier;
use crate::domain::models::product::ProductCreated;

pub const NEW_PRODUCT_SUBJECT: &str = "New Product Added!";

/// Emails the configured recipients about every new product.
///
/// Undecodable payloads are rejected (dead-lettered at once); notifier failures are returned
/// as handler errors, so the broker retries them.
pub struct ProductNotificationHandler {
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
}

impl ProductNotificationHandler {
    pub fn new(notifier: Arc<dyn Notifier>, recipients: Vec<String>) -> Self {
        Self { notifier, recipients }
    }

    pub fn body_for(product: &ProductCreated) -> String {
        format!("{} has been added to the menu.", product.name)
    }
}

#[async_trait]
impl DeliveryHandler for ProductNotificationHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, HandlerError> {
        let product: ProductCreated = match serde_json::from_slice(&delivery.payload) {
            Ok(product) => product,
            Err(err) => {
                warn!("rejecting message {}: undecodable payload: {}", delivery.message_id, err);
                return Ok(Outcome::reject());
            }
        };

        debug!(
            "notifying {} recipients about product {} (attempt {})",
            self.recipients.len(),
            product.product_id,
            delivery.attempt_count
        );
        self.notifier
            .send(&self.recipients, NEW_PRODUCT_SUBJECT, &Self::body_for(&product))
            .await
            .map_err(|err| HandlerError::new(err.to_string()))?;

        Ok(Outcome::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::product::Product;
    use crate::domain::services::notification::notifier::{MockNotifier, NotifyError};
    use bytes::Bytes;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use topic_broker::{MessageId, QueueId, RoutingKey};

    fn delivery(payload: Bytes) -> Delivery {
        Delivery {
            queue_id: QueueId::new("notifications"),
            message_id: MessageId::new(),
            exchange: "product.exchange".to_owned(),
            routing_key: RoutingKey::parse("product.created").unwrap(),
            payload,
            published_at: Utc::now(),
            attempt_count: 1,
        }
    }

    fn product_delivery(name: &str) -> Delivery {
        let product = Product::new(name, dec!(1.00), dec!(2.50));
        delivery(Bytes::from(serde_json::to_vec(&ProductCreated::from(&product)).unwrap()))
    }

    #[tokio::test]
    async fn test_sends_new_product_email() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .times(1)
            .returning(|recipients, subject, body| {
                assert_eq!(recipients, ["owner@example.com".to_owned()]);
                assert_eq!(subject, "New Product Added!");
                assert_eq!(body, "Widget has been added to the menu.");
                Ok(())
            });

        let handler = ProductNotificationHandler::new(Arc::new(notifier), vec!["owner@example.com".to_owned()]);
        assert_eq!(handler.handle(&product_delivery("Widget")).await, Ok(Outcome::Ack));
    }

    #[tokio::test]
    async fn test_notifier_failure_is_a_handler_error() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .returning(|_, _, _| Err(NotifyError::Transport("smtp timeout".to_owned())));

        let handler = ProductNotificationHandler::new(Arc::new(notifier), vec!["owner@example.com".to_owned()]);
        let err = handler.handle(&product_delivery("Widget")).await.unwrap_err();
        assert!(err.message().contains("smtp timeout"));
    }

    #[tokio::test]
    async fn test_poison_payload_is_rejected_without_sending() {
        let mut notifier = MockNotifier::new();
        notifier.expect_send().times(0);

        let handler = ProductNotificationHandler::new(Arc::new(notifier), vec!["owner@example.com".to_owned()]);
        let outcome = handler.handle(&delivery(Bytes::from_static(b"Widget"))).await;
        assert_eq!(outcome, Ok(Outcome::reject()));
    }
}
