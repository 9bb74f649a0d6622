use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mockall::mock;
use rust_decimal_macros::dec;
use topic_broker::{BrokerError, BrokerResult, EventPublisher, MessageId};

use super::{CatalogError, CatalogEvents, ProductCatalog, RetryPolicy};
use crate::domain::models::product::{PRODUCT_CREATED, PRODUCT_EXCHANGE, Product, ProductCreated};

mock! {
    pub Publisher {}

    #[async_trait]
    impl EventPublisher for Publisher {
        async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> BrokerResult<MessageId>;
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50))
}

#[tokio::test]
async fn test_product_created_is_published_as_json() {
    let product = Product::new("Widget", dec!(1.00), dec!(2.50));
    let expected = ProductCreated::from(&product);
    let message_id = MessageId::new();

    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish()
        .times(1)
        .returning(move |exchange, routing_key, payload| {
            assert_eq!(exchange, PRODUCT_EXCHANGE);
            assert_eq!(routing_key, PRODUCT_CREATED);
            let decoded: ProductCreated = serde_json::from_slice(&payload).unwrap();
            assert_eq!(decoded, expected);
            Ok(message_id)
        });

    let events = CatalogEvents::new(Arc::new(publisher));
    assert_eq!(events.product_created(&product).await.unwrap(), message_id);
}

#[tokio::test(start_paused = true)]
async fn test_broker_unavailable_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut publisher = MockPublisher::new();
    publisher.expect_publish().times(2).returning(move |_, _, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(BrokerError::BrokerUnavailable("restarting".to_owned()))
        } else {
            Ok(MessageId::new())
        }
    });

    let events = CatalogEvents::new(Arc::new(publisher)).with_retry(fast_retry());
    let product = Product::new("Widget", dec!(1.00), dec!(2.50));
    assert!(events.product_created(&product).await.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_unavailability_is_reported() {
    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish()
        .times(3)
        .returning(|_, _, _| Err(BrokerError::BrokerUnavailable("down".to_owned())));

    let events = CatalogEvents::new(Arc::new(publisher)).with_retry(fast_retry());
    let product = Product::new("Widget", dec!(1.00), dec!(2.50));
    let result = events.product_created(&product).await;
    assert!(matches!(result, Err(CatalogError::Publish(BrokerError::BrokerUnavailable(_)))));
}

#[tokio::test]
async fn test_validation_errors_are_not_retried() {
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().times(1).returning(|_, _, _| {
        Err(BrokerError::InvalidRoutingKey {
            key: String::new(),
            reason: "empty".to_owned(),
        })
    });

    let events = CatalogEvents::new(Arc::new(publisher)).with_retry(fast_retry());
    let product = Product::new("Widget", dec!(1.00), dec!(2.50));
    let result = events.product_created(&product).await;
    assert!(matches!(result, Err(CatalogError::Publish(BrokerError::InvalidRoutingKey { .. }))));
}

#[tokio::test]
async fn test_invalid_products_are_never_announced() {
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().times(0);
    let catalog = ProductCatalog::new(CatalogEvents::new(Arc::new(publisher)));

    let blank = catalog.create_product("  ", dec!(1.00), dec!(2.00), None).await;
    assert!(matches!(blank, Err(CatalogError::InvalidProduct(_))));

    let negative = catalog.create_product("Widget", dec!(1.00), dec!(-2.00), None).await;
    assert!(matches!(negative, Err(CatalogError::InvalidProduct(_))));
    assert!(catalog.list().is_empty());
}

#[tokio::test]
async fn test_created_product_is_stored_and_announced() {
    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish()
        .times(1)
        .returning(|_, _, _| Ok(MessageId::new()));
    let catalog = ProductCatalog::new(CatalogEvents::new(Arc::new(publisher)));

    let product = catalog
        .create_product(" Widget ", dec!(1.00), dec!(2.50), Some("widget.png"))
        .await
        .unwrap();
    assert_eq!(product.name, "Widget");
    assert_eq!(product.image.as_deref(), Some("widget.png"));
    assert_eq!(catalog.get(&product.id), Some(product.clone()));
    assert_eq!(catalog.list(), vec![product]);
}

#[tokio::test]
async fn test_product_is_kept_when_announcement_fails() {
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().returning(|_, _, _| {
        Err(BrokerError::InvalidRoutingKey {
            key: String::new(),
            reason: "empty".to_owned(),
        })
    });
    let catalog = ProductCatalog::new(CatalogEvents::new(Arc::new(publisher)));

    let result = catalog.create_product("Widget", dec!(1.00), dec!(2.50), None).await;
    assert!(result.is_err());
    assert_eq!(catalog.list().len(), 1);
}
