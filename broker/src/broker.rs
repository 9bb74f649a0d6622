//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                          | Key Methods          |
// |-----------------|------------------------------------------------------|----------------------|
// | BrokerBuilder   | Configures and starts a broker                       | dead_letter_sink,    |
// |                 |                                                      | start                |
// | Broker          | Cloneable handle to the running broker               | publish, deliver,    |
// |                 |                                                      | ack, nack, bind,     |
// |                 |                                                      | unbind, shutdown     |
//--------------------------------------------------------------------------------------------------
//
// Locking: router -> queue arena -> individual queues (in queue id order). Locks are always taken
// in that order and never held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio::{pin, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterSink};
use crate::error::{BrokerError, BrokerResult};
use crate::queue::{AckOutcome, NackOutcome, Queue, QueueStats};
use crate::router::{RoutingKey, TopicRouter};
use crate::snapshot::{BrokerSnapshot, QueueRecord, SnapshotStore};
use crate::types::{Delivery, DeliveryState, Event, MessageId, QueueId, Subscription, SubscriptionId};

struct QueueSlot {
    queue: Mutex<Queue>,
    /// Wakes consumers waiting in `deliver`
    ready: Notify,
}

impl QueueSlot {
    fn new(queue: Queue) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(queue),
            ready: Notify::new(),
        })
    }
}

struct BrokerInner {
    config: BrokerConfig,
    router: RwLock<TopicRouter>,
    queues: RwLock<HashMap<QueueId, Arc<QueueSlot>>>,
    sink: Arc<dyn DeadLetterSink>,
    available: AtomicBool,
    shutdown: CancellationToken,
    /// Wakes publishers waiting for queue space
    space: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    snapshots: Option<SnapshotStore>,
}

/// Builder for a [`Broker`]
pub struct BrokerBuilder {
    config: BrokerConfig,
    sink: Option<Arc<dyn DeadLetterSink>>,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config, sink: None }
    }

    /// Replaces the default in-memory dead letter sink
    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Restores the persisted snapshot (when a snapshot path is configured) and spawns the
    /// redelivery sweeper.
    ///
    /// # Errors
    /// Returns `BrokerError::Snapshot` if an existing snapshot cannot be read
    pub async fn start(self) -> BrokerResult<Broker> {
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterSink::new(self.config.dead_letter_capacity)));
        let snapshots = self.config.snapshot_path.clone().map(SnapshotStore::new);

        let broker = Broker {
            inner: Arc::new(BrokerInner {
                config: self.config,
                router: RwLock::new(TopicRouter::new()),
                queues: RwLock::new(HashMap::new()),
                sink,
                available: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
                space: Notify::new(),
                sweeper: Mutex::new(None),
                snapshots,
            }),
        };

        if let Some(store) = &broker.inner.snapshots {
            if let Some(snapshot) = store.load().await? {
                broker.restore(snapshot);
            }
        }

        let handle = tokio::spawn(run_sweeper(
            Arc::downgrade(&broker.inner),
            broker.inner.shutdown.clone(),
            broker.inner.config.sweep_interval,
        ));
        *broker.inner.sweeper.lock() = Some(handle);

        info!("broker started");
        Ok(broker)
    }
}

/// In-process topic broker.
///
/// Cheap to clone; all clones share the same queues. Call [`Broker::shutdown`] to stop the
/// sweeper and write the final snapshot.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Starts a broker with the default dead letter sink
    pub async fn start(config: BrokerConfig) -> BrokerResult<Self> {
        BrokerBuilder::new(config).start().await
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    fn ensure_available(&self) -> BrokerResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(unavailable())
        }
    }

    fn slot(&self, queue_id: &QueueId) -> BrokerResult<Arc<QueueSlot>> {
        self.inner
            .queues
            .read()
            .get(queue_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue_id.to_string()))
    }

    fn dead_letter(&self, letters: Vec<DeadLetter>) {
        if letters.is_empty() {
            return;
        }
        for letter in letters {
            self.inner.sink.accept(letter);
        }
        self.inner.space.notify_waiters();
    }

    //----------------------------------------------------------------------------------------------
    // Topology
    //----------------------------------------------------------------------------------------------

    /// Creates the queue if it does not exist yet.
    ///
    /// Exclusive queues are deleted once their last binding goes away; other queues live until
    /// [`Broker::delete_queue`].
    pub fn declare_queue(&self, queue_id: &QueueId, exclusive: bool) -> BrokerResult<()> {
        self.ensure_available()?;

        let mut queues = self.inner.queues.write();
        if !queues.contains_key(queue_id) {
            let queue = Queue::new(queue_id.clone(), exclusive, &self.inner.config);
            queues.insert(queue_id.clone(), QueueSlot::new(queue));
            debug!("queue {} declared (exclusive: {})", queue_id, exclusive);
        }
        Ok(())
    }

    /// Registers a binding. The target queue must have been declared.
    ///
    /// Returns the binding previously registered under the same id, if any.
    pub fn bind(&self, subscription: Subscription) -> BrokerResult<Option<Subscription>> {
        self.ensure_available()?;

        let previous = {
            let mut router = self.inner.router.write();
            if !self.inner.queues.read().contains_key(&subscription.queue_id) {
                return Err(BrokerError::UnknownQueue(subscription.queue_id.to_string()));
            }
            info!(
                "binding {} to queue {} with pattern {} on {}",
                subscription.id, subscription.queue_id, subscription.pattern, subscription.exchange
            );
            router.register(subscription.clone())
        };

        if let Some(previous) = &previous {
            if previous.queue_id != subscription.queue_id {
                self.collect_exclusive(&previous.queue_id);
            }
        }
        Ok(previous)
    }

    /// Removes a binding; an exclusive queue left without bindings is deleted.
    ///
    /// Works after shutdown so consumers can always detach.
    pub fn unbind(&self, subscription_id: &SubscriptionId) -> BrokerResult<Subscription> {
        let subscription = self
            .inner
            .router
            .write()
            .unregister(subscription_id)
            .ok_or_else(|| BrokerError::UnknownSubscription(subscription_id.to_string()))?;

        info!("unbound {} from queue {}", subscription.id, subscription.queue_id);
        self.collect_exclusive(&subscription.queue_id);
        Ok(subscription)
    }

    /// Removes the queue and its bindings; entries still in it are dead-lettered.
    ///
    /// Returns how many entries were dead-lettered.
    pub fn delete_queue(&self, queue_id: &QueueId) -> BrokerResult<usize> {
        let (slot, dead) = {
            let mut router = self.inner.router.write();
            let mut queues = self.inner.queues.write();
            let slot = queues
                .remove(queue_id)
                .ok_or_else(|| BrokerError::UnknownQueue(queue_id.to_string()))?;
            router.unregister_queue(queue_id);
            let dead = slot.queue.lock().close();
            (slot, dead)
        };

        slot.ready.notify_waiters();
        let count = dead.len();
        info!("queue {} deleted, {} entries dead-lettered", queue_id, count);
        self.dead_letter(dead);
        Ok(count)
    }

    /// Deletes an exclusive queue that has no bindings and nothing in flight.
    ///
    /// Runs after every settle, so a queue unbound while a handler was still running goes away
    /// once that delivery is acked, requeued or expired.
    fn collect_exclusive(&self, queue_id: &QueueId) {
        let (slot, dead) = {
            let router = self.inner.router.read();
            if router.bindings_for(queue_id) > 0 {
                return;
            }

            let mut queues = self.inner.queues.write();
            let Some(slot) = queues.get(queue_id) else {
                return;
            };
            let dead = {
                let mut queue = slot.queue.lock();
                if !queue.is_exclusive() || queue.in_flight() > 0 {
                    return;
                }
                queue.close()
            };
            (queues.remove(queue_id), dead)
        };

        if let Some(slot) = slot {
            slot.ready.notify_waiters();
        }
        if !dead.is_empty() {
            warn!(
                "exclusive queue {} deleted with {} pending entries",
                queue_id,
                dead.len()
            );
        } else {
            debug!("exclusive queue {} deleted", queue_id);
        }
        self.dead_letter(dead);
    }

    //----------------------------------------------------------------------------------------------
    // Publish
    //----------------------------------------------------------------------------------------------

    /// Fans the event out to every queue with a matching binding.
    ///
    /// Either every matching queue receives the entry or none does. When a matching queue is
    /// full the call waits for space up to `publish_timeout`.
    ///
    /// # Errors
    /// Returns `BrokerError::BrokerUnavailable` if the broker is shut down or the publish timed
    /// out; in both cases nothing was enqueued
    pub async fn publish(&self, event: Event) -> BrokerResult<MessageId> {
        let timeout = self.inner.config.publish_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_available()?;

            let space = self.inner.space.notified();
            pin!(space);
            space.as_mut().enable();

            match self.try_publish(&event) {
                Ok(()) => return Ok(event.message_id()),
                Err(BrokerError::QueueFull(queue)) => {
                    debug!("queue {} is full, publish of {} waiting", queue, event.message_id());
                    select! {
                        _ = &mut space => {}
                        _ = sleep_until(deadline) => {
                            warn!("publish of {} timed out, queue {} is full", event.message_id(), queue);
                            return Err(BrokerError::BrokerUnavailable(format!(
                                "publish timed out after {timeout:?}: queue {queue} is full"
                            )));
                        }
                        _ = self.inner.shutdown.cancelled() => return Err(unavailable()),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_publish(&self, event: &Event) -> BrokerResult<()> {
        // The router stays read-locked so bindings cannot change under the fan-out, and so
        // shutdown can wait for publishes that are already past this check
        let router = self.inner.router.read();
        self.ensure_available()?;
        let queue_ids = router.queues_for(event.exchange(), event.routing_key());

        if queue_ids.is_empty() {
            debug!(
                "no binding matches {} on {}, message {} dropped",
                event.routing_key(),
                event.exchange(),
                event.message_id()
            );
            return Ok(());
        }

        let slots: Vec<Arc<QueueSlot>> = {
            let queues = self.inner.queues.read();
            queue_ids.iter().filter_map(|id| queues.get(id).cloned()).collect()
        };

        let mut guards: Vec<_> = slots.iter().map(|slot| slot.queue.lock()).collect();
        guards.retain(|queue| !queue.is_closed());

        if let Some(full) = guards.iter().find(|queue| queue.is_full()) {
            return Err(BrokerError::QueueFull(full.id().to_string()));
        }

        let now = Instant::now();
        for queue in guards.iter_mut() {
            queue.enqueue(event.clone(), now);
        }
        drop(guards);
        drop(router);

        for slot in &slots {
            slot.ready.notify_waiters();
        }
        debug!(
            "message {} ({}) enqueued on {} queues",
            event.message_id(),
            event.routing_key(),
            slots.len()
        );
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Consume
    //----------------------------------------------------------------------------------------------

    /// Hands out up to `max` ready entries of the queue, oldest first.
    ///
    /// Waits up to `wait` for something to become ready (a publish, a requeue, an expired
    /// backoff). An empty vector means nothing became ready in time.
    ///
    /// # Errors
    /// Returns `BrokerError::UnknownQueue` if the queue does not exist or gets deleted while
    /// waiting, and `BrokerError::BrokerUnavailable` once the broker shuts down
    pub async fn deliver(&self, queue_id: &QueueId, max: usize, wait: Duration) -> BrokerResult<Vec<Delivery>> {
        self.ensure_available()?;
        let slot = self.slot(queue_id)?;
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;

        loop {
            self.ensure_available()?;

            let ready = slot.ready.notified();
            pin!(ready);
            ready.as_mut().enable();

            let (deliveries, dead, wakeup, drained) = {
                let mut queue = slot.queue.lock();
                if queue.is_closed() {
                    return Err(BrokerError::UnknownQueue(queue_id.to_string()));
                }
                let in_flight = queue.in_flight();
                let (deliveries, dead) = queue.take_ready(max, Instant::now(), &self.inner.config);
                let drained = queue.is_exclusive() && in_flight > 0 && queue.in_flight() == 0;
                (deliveries, dead, queue.next_wakeup(), drained)
            };
            self.dead_letter(dead);
            if drained {
                self.collect_exclusive(queue_id);
            }

            if !deliveries.is_empty() {
                debug!("delivering {} entries from queue {}", deliveries.len(), queue_id);
                return Ok(deliveries);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let sleep_to = wakeup.map_or(deadline, |wakeup| wakeup.min(deadline));
            select! {
                _ = &mut ready => {}
                _ = sleep_until(sleep_to) => {}
                _ = self.inner.shutdown.cancelled() => return Err(unavailable()),
            }
        }
    }

    /// Settles a delivered entry. Acking an already settled message is a no-op.
    pub async fn ack(&self, queue_id: &QueueId, message_id: &MessageId) -> BrokerResult<AckOutcome> {
        self.ensure_available()?;
        let slot = self.slot(queue_id)?;

        let outcome = slot.queue.lock().ack(message_id);
        match outcome {
            AckOutcome::Acked => {
                self.inner.space.notify_waiters();
                self.collect_exclusive(queue_id);
            }
            AckOutcome::AlreadySettled(state) => {
                debug!("ack for settled message {} ({:?}) ignored", message_id, state)
            }
            AckOutcome::NotDelivered | AckOutcome::Unknown => {
                debug!("ack for message {} on queue {} ignored: {:?}", message_id, queue_id, outcome)
            }
        }
        Ok(outcome)
    }

    /// Fails a delivered entry: requeued with backoff while `requeue` is set and attempts remain,
    /// dead-lettered otherwise.
    pub async fn nack(&self, queue_id: &QueueId, message_id: &MessageId, requeue: bool) -> BrokerResult<NackOutcome> {
        self.ensure_available()?;
        let slot = self.slot(queue_id)?;

        let (outcome, dead) =
            slot.queue
                .lock()
                .nack(message_id, requeue, Instant::now(), &self.inner.config);

        match outcome {
            NackOutcome::Requeued { .. } => {
                slot.ready.notify_waiters();
                self.collect_exclusive(queue_id);
            }
            NackOutcome::DeadLettered(_) => {
                self.dead_letter(dead.into_iter().collect());
                self.collect_exclusive(queue_id);
            }
            _ => debug!("nack for message {} on queue {} ignored: {:?}", message_id, queue_id, outcome),
        }
        Ok(outcome)
    }

    //----------------------------------------------------------------------------------------------
    // Inspection
    //----------------------------------------------------------------------------------------------

    /// Current state of a message on a queue, including recently settled ones
    pub fn message_state(&self, queue_id: &QueueId, message_id: &MessageId) -> BrokerResult<Option<DeliveryState>> {
        Ok(self.slot(queue_id)?.queue.lock().state_of(message_id))
    }

    pub fn queue_stats(&self, queue_id: &QueueId) -> BrokerResult<QueueStats> {
        let bindings = self.inner.router.read().bindings_for(queue_id);
        Ok(self.slot(queue_id)?.queue.lock().stats(bindings))
    }

    pub fn queues(&self) -> Vec<QueueId> {
        let mut ids: Vec<QueueId> = self.inner.queues.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscription(&self, subscription_id: &SubscriptionId) -> Option<Subscription> {
        self.inner.router.read().get(subscription_id).cloned()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<Subscription> = self.inner.router.read().subscriptions().cloned().collect();
        subscriptions.sort_by(|a, b| a.id.cmp(&b.id));
        subscriptions
    }

    /// Bindings matching `routing_key` on `exchange`
    pub fn matching_subscriptions(&self, exchange: &str, routing_key: &RoutingKey) -> Vec<Subscription> {
        self.inner
            .router
            .read()
            .route(exchange, routing_key)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.sink.dead_letters()
    }

    //----------------------------------------------------------------------------------------------
    // Persistence & lifecycle
    //----------------------------------------------------------------------------------------------

    pub fn snapshot(&self) -> BrokerSnapshot {
        let router = self.inner.router.read();
        let queues = self.inner.queues.read();

        let mut subscriptions: Vec<Subscription> = router.subscriptions().cloned().collect();
        subscriptions.sort_by(|a, b| a.id.cmp(&b.id));

        let queues = queues
            .iter()
            .map(|(id, slot)| {
                let queue = slot.queue.lock();
                let record = QueueRecord {
                    exclusive: queue.is_exclusive(),
                    entries: queue.entries(),
                };
                (id.clone(), record)
            })
            .collect();

        BrokerSnapshot { subscriptions, queues }
    }

    /// Writes a snapshot if a snapshot path is configured
    pub async fn save_snapshot(&self) -> BrokerResult<()> {
        match &self.inner.snapshots {
            Some(store) => store.save(&self.snapshot()).await,
            None => Ok(()),
        }
    }

    /// Rebuilds queues and bindings from a snapshot.
    ///
    /// Only durable queues come back with their bindings: exclusive queues belonged to consumers
    /// of the previous process, so their leftover entries are dead-lettered instead.
    fn restore(&self, snapshot: BrokerSnapshot) {
        let now = Instant::now();
        let mut orphaned = Vec::new();
        let mut exhausted = Vec::new();

        {
            let mut router = self.inner.router.write();
            let mut queues = self.inner.queues.write();

            for (queue_id, record) in snapshot.queues {
                let mut queue = Queue::new(queue_id.clone(), record.exclusive, &self.inner.config);
                exhausted.extend(queue.restore(record.entries, now, &self.inner.config));

                if record.exclusive {
                    orphaned.extend(queue.close());
                } else {
                    queues.insert(queue_id, QueueSlot::new(queue));
                }
            }

            let durable = snapshot
                .subscriptions
                .into_iter()
                .filter(|subscription| queues.contains_key(&subscription.queue_id));
            *router = TopicRouter::from_subscriptions(durable);

            info!(
                "restored {} queues and {} bindings from snapshot",
                queues.len(),
                router.len()
            );
        }

        if !orphaned.is_empty() {
            warn!(
                "{} entries of exclusive queues dead-lettered on restore ({})",
                orphaned.len(),
                DeadLetterReason::QueueDeleted
            );
        }
        self.dead_letter(orphaned);

        if !exhausted.is_empty() {
            warn!(
                "{} restored entries had no attempts left ({})",
                exhausted.len(),
                DeadLetterReason::MaxAttemptsExceeded
            );
        }
        self.dead_letter(exhausted);
    }

    /// Fails expired deliveries on every queue
    fn sweep(&self) {
        let slots: Vec<Arc<QueueSlot>> = self.inner.queues.read().values().cloned().collect();
        let now = Instant::now();
        let mut drained = Vec::new();

        for slot in slots {
            let (dead, ready) = {
                let mut queue = slot.queue.lock();
                let in_flight = queue.in_flight();
                let dead = queue.reap_expired(now, &self.inner.config);
                if queue.is_exclusive() && in_flight > 0 && queue.in_flight() == 0 {
                    drained.push(queue.id().clone());
                }
                let ready = queue.next_wakeup().is_some_and(|wakeup| wakeup <= now);
                (dead, ready)
            };

            if ready || !dead.is_empty() {
                slot.ready.notify_waiters();
            }
            self.dead_letter(dead);
        }

        for queue_id in drained {
            self.collect_exclusive(&queue_id);
        }
    }

    /// Stops the sweeper, rejects every further operation with `BrokerUnavailable` and writes a
    /// final snapshot. Calling it again is a no-op.
    pub async fn shutdown(&self) -> BrokerResult<()> {
        if !self.inner.available.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        // Publishes hold the router read lock from their availability check to the enqueue
        drop(self.inner.router.write());

        self.inner.shutdown.cancel();
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(err) = handle.await {
                error!("sweeper task failed: {}", err);
            }
        }

        let slots: Vec<Arc<QueueSlot>> = self.inner.queues.read().values().cloned().collect();
        for slot in slots {
            slot.ready.notify_waiters();
        }
        self.inner.space.notify_waiters();

        self.save_snapshot().await?;
        info!("broker shut down");
        Ok(())
    }
}

fn unavailable() -> BrokerError {
    BrokerError::BrokerUnavailable("broker is shut down".to_owned())
}

async fn run_sweeper(inner: Weak<BrokerInner>, token: CancellationToken, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_snapshot = Instant::now();

    loop {
        select! {
            _ = token.cancelled() => {
                debug!("sweeper stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let broker = Broker { inner };
        broker.sweep();

        let snapshot_due = broker.inner.snapshots.is_some()
            && last_snapshot.elapsed() >= broker.inner.config.snapshot_interval;
        if snapshot_due {
            if let Err(err) = broker.save_snapshot().await {
                error!("periodic snapshot failed: {}", err);
            }
            last_snapshot = Instant::now();
        }
    }
}
