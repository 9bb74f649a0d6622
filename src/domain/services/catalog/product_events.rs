use std::sync::Arc;

use bytes::Bytes;
use topic_broker::{BrokerError, EventPublisher, MessageId};
use tracing::info;

use super::retry::RetryPolicy;
use crate::domain::models::product::{PRODUCT_CREATED, PRODUCT_EXCHANGE, Product, ProductCreated};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Invalid product: {0}")]
    InvalidProduct(String),
    #[error("Failed to encode product event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to publish product event: {0}")]
    Publish(#[from] BrokerError),
}

/// Emits catalog domain events through any [`EventPublisher`]
#[derive(Clone)]
pub struct CatalogEvents {
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
}

impl CatalogEvents {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            publisher,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Publishes `product.created` for `product`, retrying while the broker is unavailable
    pub async fn product_created(&self, product: &Product) -> Result<MessageId, CatalogError> {
        let payload = Bytes::from(serde_json::to_vec(&ProductCreated::from(product))?);

        let message_id = self
            .retry
            .run(|| self.publisher.publish(PRODUCT_EXCHANGE, PRODUCT_CREATED, payload.clone()))
            .await?;

        info!("product {} ({}) announced as message {}", product.name, product.id, message_id);
        Ok(message_id)
    }
}
