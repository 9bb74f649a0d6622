//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name             | Description                                           | Key Methods        |
// |------------------|-------------------------------------------------------|--------------------|
// | Outcome          | Handler verdict: ack, or nack with/without requeue    | nack, reject       |
// | DeliveryHandler  | Processes one delivery                                | handle             |
// | EventConsumer    | Subscriber capability                                 | subscribe,         |
// |                  |                                                       | unsubscribe        |
// | SubscribeOptions | Pattern, queue naming, group and prefetch             |                    |
// | Consumer         | EventConsumer backed by an in-process Broker          | subscribe_with,    |
// |                  |                                                       | shutdown           |
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult, HandlerError};
use crate::router::TopicPattern;
use crate::types::{Delivery, QueueId, Subscription, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack { requeue: bool },
}

impl Outcome {
    /// Nack and retry later
    pub fn nack() -> Self {
        Self::Nack { requeue: true }
    }

    /// Nack straight to the dead letter sink
    pub fn reject() -> Self {
        Self::Nack { requeue: false }
    }
}

/// Processes deliveries for a subscription.
///
/// Handlers must be idempotent: delivery is at-least-once. An `Err` (or a panic) is treated as
/// `Outcome::Nack { requeue: true }`.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, HandlerError>;
}

/// Handler built from an async closure, see [`handler_fn`]
pub struct FnHandler<F>(F);

/// Wraps an async closure into a [`DeliveryHandler`]
///
/// ```
/// use topic_broker::{Outcome, handler_fn};
///
/// let handler = handler_fn(|delivery| async move {
///     println!("got {:?}", delivery.payload);
///     Ok(Outcome::Ack)
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> DeliveryHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, HandlerError> {
        (self.0)(delivery.clone()).await
    }
}

/// Subscriber capability
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Binds `pattern` and starts feeding matching deliveries to `handler`
    async fn subscribe(&self, pattern: &str, handler: Arc<dyn DeliveryHandler>) -> BrokerResult<SubscriptionId>;

    /// Stops future deliveries; handler invocations already running are not aborted
    async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> BrokerResult<()>;
}

/// How a subscription gets its queue.
///
/// - with a consumer group, every member shares the queue named after the group, so each event
///   is handled by one member;
/// - with a queue name, the subscription binds that durable queue;
/// - otherwise it gets its own exclusive queue, deleted on unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub pattern: String,
    pub queue: Option<String>,
    pub consumer_group: Option<String>,
    /// Overrides the broker's default prefetch
    pub prefetch: Option<usize>,
}

impl SubscribeOptions {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_owned(),
            queue: None,
            consumer_group: None,
            prefetch: None,
        }
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_owned());
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.consumer_group = Some(group.to_owned());
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Consumer of one exchange.
///
/// Each subscription runs a consume loop that keeps up to `prefetch` handler invocations in
/// flight. Call [`Consumer::shutdown`] to stop every loop gracefully; dropping the consumer only
/// cancels them.
pub struct Consumer {
    broker: Broker,
    exchange: String,
    workers: Mutex<HashMap<SubscriptionId, Worker>>,
}

impl Consumer {
    pub fn new(broker: Broker, exchange: &str) -> Self {
        Self {
            broker,
            exchange: exchange.to_owned(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self.workers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// # Errors
    /// Returns `BrokerError::InvalidPattern` for a malformed pattern and
    /// `BrokerError::BrokerUnavailable` if the broker is shut down
    pub async fn subscribe_with(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> BrokerResult<SubscriptionId> {
        let pattern = TopicPattern::parse(options.pattern.as_str())?;
        let id = SubscriptionId::generate();

        let (queue_id, exclusive) = match (&options.consumer_group, &options.queue) {
            (Some(group), _) => (QueueId::new(group.as_str()), false),
            (None, Some(queue)) => (QueueId::new(queue.as_str()), false),
            (None, None) => (QueueId::new(id.as_str()), true),
        };

        self.broker.declare_queue(&queue_id, exclusive)?;

        let mut subscription = Subscription::new(id.clone(), self.exchange.as_str(), pattern, queue_id.clone());
        if let Some(group) = options.consumer_group {
            subscription = subscription.in_group(group);
        }
        self.broker.bind(subscription)?;

        let prefetch = options.prefetch.unwrap_or(self.broker.config().prefetch).max(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consume(
            self.broker.clone(),
            queue_id,
            id.clone(),
            handler,
            prefetch,
            cancel.clone(),
        ));

        self.workers.lock().insert(id.clone(), Worker { cancel, handle });
        info!("subscribed {} to {} on {}", id, options.pattern, self.exchange);
        Ok(id)
    }

    /// Unsubscribes everything and waits for the consume loops to finish
    pub async fn shutdown(&self) {
        for id in self.subscriptions() {
            if let Err(err) = self.unsubscribe(&id).await {
                warn!("error while unsubscribing {}: {}", id, err);
            }
        }
    }
}

#[async_trait]
impl EventConsumer for Consumer {
    async fn subscribe(&self, pattern: &str, handler: Arc<dyn DeliveryHandler>) -> BrokerResult<SubscriptionId> {
        self.subscribe_with(SubscribeOptions::new(pattern), handler).await
    }

    async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> BrokerResult<()> {
        let worker = self.workers.lock().remove(subscription_id);
        // unbind first so nothing new is routed to the queue
        let unbound = self.broker.unbind(subscription_id);

        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(err) = worker.handle.await {
                error!("consume loop of {} failed: {}", subscription_id, err);
            }
            info!("unsubscribed {}", subscription_id);
            return Ok(());
        }

        unbound.map(|_| ())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().values() {
            worker.cancel.cancel();
        }
    }
}

async fn consume(
    broker: Broker,
    queue_id: QueueId,
    subscription_id: SubscriptionId,
    handler: Arc<dyn DeliveryHandler>,
    prefetch: usize,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(prefetch));
    let wait = broker.config().deliver_wait;

    loop {
        let first = select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let mut held = vec![first];
        while let Ok(permit) = permits.clone().try_acquire_owned() {
            held.push(permit);
        }

        // Cancellation is checked first so a completed `deliver` is never thrown away
        let result = select! {
            biased;
            _ = cancel.cancelled() => break,
            result = broker.deliver(&queue_id, held.len(), wait) => result,
        };

        match result {
            Ok(deliveries) => {
                for (delivery, permit) in deliveries.into_iter().zip(held.drain(..)) {
                    let broker = broker.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        process(&broker, handler.as_ref(), delivery).await;
                        drop(permit);
                    });
                }
            }
            Err(BrokerError::BrokerUnavailable(reason)) => {
                info!("consume loop of {} stopping: {}", subscription_id, reason);
                break;
            }
            Err(BrokerError::UnknownQueue(queue)) => {
                info!("consume loop of {} stopping: queue {} is gone", subscription_id, queue);
                break;
            }
            Err(err) => {
                error!("consume loop of {} failed: {}", subscription_id, err);
                break;
            }
        }
    }

    // In-flight handlers finish (or give up after the visibility timeout) before we return
    let drained = timeout(
        broker.config().visibility_timeout,
        permits.acquire_many(prefetch as u32),
    )
    .await;
    if drained.is_err() {
        warn!("consume loop of {} stopped with handlers still running", subscription_id);
    }
    debug!("consume loop of {} stopped", subscription_id);
}

/// Runs the handler and settles the delivery with the broker
async fn process(broker: &Broker, handler: &dyn DeliveryHandler, delivery: Delivery) {
    let outcome = match AssertUnwindSafe(handler.handle(&delivery)).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            error!(
                "handler failed for message {} (attempt {}): {}",
                delivery.message_id, delivery.attempt_count, err
            );
            Outcome::nack()
        }
        Err(_) => {
            error!(
                "handler panicked for message {} (attempt {})",
                delivery.message_id, delivery.attempt_count
            );
            Outcome::nack()
        }
    };

    let settle = async {
        match outcome {
            Outcome::Ack => broker.ack(&delivery.queue_id, &delivery.message_id).await.map(|_| ()),
            Outcome::Nack { requeue } => broker
                .nack(&delivery.queue_id, &delivery.message_id, requeue)
                .await
                .map(|_| ()),
        }
    };

    match timeout(broker.config().ack_timeout, settle).await {
        Ok(Ok(())) => debug!("message {} settled with {:?}", delivery.message_id, outcome),
        Ok(Err(err)) => warn!("could not settle message {}: {}", delivery.message_id, err),
        Err(_) => warn!("settling message {} timed out", delivery.message_id),
    }
}
