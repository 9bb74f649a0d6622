use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use catalog_notifier::{
    CatalogEvents, Config, LogNotifier, PRODUCT_BINDING, PRODUCT_EXCHANGE, ProductCatalog,
    ProductNotificationHandler,
};
use clap::Parser;
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::time::{Instant, sleep};
use topic_broker::{Broker, Consumer, Publisher, SubscribeOptions};
use tracing::{error, info, warn};

/// Consumer group of the notification sender
const NOTIFICATIONS_GROUP: &str = "product.notifications";

/// Command line arguments for the catalog notifier
#[derive(Parser, Debug)]
#[command(author, version, about = "Creates products and emails a notification for each one")]
struct Args {
    /// Product to create (repeatable)
    #[arg(short, long = "product", default_value = "Widget")]
    products: Vec<String>,

    /// Cost of every created product
    #[arg(long, default_value = "1.00")]
    cost: Decimal,

    /// Price of every created product
    #[arg(long, default_value = "2.50")]
    price: Decimal,

    /// Notification recipient (repeatable); overrides NOTIFY_RECIPIENTS
    #[arg(short, long = "recipient")]
    recipients: Vec<String>,

    /// Seconds to wait for every notification to be sent
    #[arg(short, long, default_value = "10")]
    wait: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = Config::try_from_env().context("invalid configuration")?;
    if !args.recipients.is_empty() {
        config.recipients = args.recipients.clone();
    }
    if config.recipients.is_empty() {
        warn!("no notification recipients configured, notifications will be dead-lettered");
    }

    let broker = Broker::start(config.broker.clone())
        .await
        .context("failed to start broker")?;

    // Notification sender
    let notifier = Arc::new(LogNotifier::new(&config.notify_from));
    let consumer = Consumer::new(broker.clone(), PRODUCT_EXCHANGE);
    let handler = ProductNotificationHandler::new(notifier.clone(), config.recipients.clone());
    let subscription = consumer
        .subscribe_with(
            SubscribeOptions::new(PRODUCT_BINDING).group(NOTIFICATIONS_GROUP),
            Arc::new(handler),
        )
        .await
        .context("failed to subscribe notification handler")?;
    info!("notification handler subscribed as {}", subscription);

    // Catalog
    let publisher = Publisher::new(broker.clone(), &config.app_id);
    info!("publishing catalog events as {}", publisher.app_id());
    let catalog = ProductCatalog::new(CatalogEvents::new(Arc::new(publisher)));

    let created = join_all(
        args.products
            .iter()
            .map(|name| catalog.create_product(name, args.cost, args.price, None)),
    )
    .await;

    let mut announced = 0;
    for (name, result) in args.products.iter().zip(created) {
        match result {
            Ok(product) => {
                announced += 1;
                info!("created {} at {} (margin {})", product.name, product.price, product.margin());
            }
            Err(err) => error!("failed to create product {}: {}", name, err),
        }
    }

    let deadline = Instant::now() + Duration::from_secs(args.wait);
    while notifier.sent().len() < announced
        && broker.dead_letters().is_empty()
        && Instant::now() < deadline
    {
        sleep(Duration::from_millis(100)).await;
    }

    info!("{} of {} notifications sent", notifier.sent().len(), announced);
    for letter in broker.dead_letters() {
        warn!(
            "dead letter {} on {} after {} attempts: {}",
            letter.entry.event.message_id(),
            letter.queue_id,
            letter.entry.attempt_count,
            letter.reason
        );
    }
    info!("catalog holds {} products", catalog.list().len());

    consumer.shutdown().await;
    broker.shutdown().await.context("failed to shut down broker")?;
    Ok(())
}
