//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                          | Key Methods          |
// |-----------------|------------------------------------------------------|----------------------|
// | Queue           | Per-queue delivery state machine                     | take_ready, ack,     |
// |                 |                                                      | nack, next_wakeup    |
// | AckOutcome      | What an ack did                                      |                      |
// | NackOutcome     | What a nack did                                      |                      |
// | QueueStats      | Point-in-time counters of a queue                    |                      |
//--------------------------------------------------------------------------------------------------
//
// Every operation takes `now` explicitly, so the state machine is deterministic and never reads
// the clock on its own (the wall-clock `last_attempt_at` stamp aside).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::dead_letter::{DeadLetter, DeadLetterReason};
use crate::types::{Delivery, DeliveryState, Event, MessageId, QueueEntry, QueueId};

/// Result of acknowledging a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    /// Already acked or dead-lettered; nothing changed
    AlreadySettled(DeliveryState),
    /// The entry exists but has never been handed to a consumer
    NotDelivered,
    /// Not tracked by the queue (never routed here, or forgotten from the settled history)
    Unknown,
}

/// Result of negatively acknowledging a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back to pending; eligible for redelivery after `delay`
    Requeued { delay: Duration },
    DeadLettered(DeadLetterReason),
    AlreadySettled(DeliveryState),
    /// Not currently delivered, e.g. it already timed out and was requeued
    NotDelivered,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_id: QueueId,
    pub exclusive: bool,
    pub pending: usize,
    pub in_flight: usize,
    pub bindings: usize,
}

#[derive(Debug)]
struct Tracked {
    entry: QueueEntry,
    /// Not deliverable before this instant (retry backoff)
    ready_at: Instant,
    /// Set while delivered; past it the delivery counts as failed
    visible_until: Option<Instant>,
}

enum Failure {
    Requeued(Duration),
    DeadLettered(DeadLetter),
}

/// Terminal states of recently settled messages, oldest forgotten first
#[derive(Debug)]
struct SettledHistory {
    capacity: usize,
    order: VecDeque<MessageId>,
    states: HashMap<MessageId, DeliveryState>,
}

impl SettledHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            states: HashMap::new(),
        }
    }

    fn record(&mut self, message_id: MessageId, state: DeliveryState) {
        if self.capacity == 0 {
            return;
        }
        if self.states.insert(message_id, state).is_none() {
            self.order.push_back(message_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    fn get(&self, message_id: &MessageId) -> Option<DeliveryState> {
        self.states.get(message_id).copied()
    }
}

#[derive(Debug)]
pub(crate) struct Queue {
    id: QueueId,
    exclusive: bool,
    closed: bool,
    capacity: usize,
    /// Live entries keyed by enqueue sequence, i.e. FIFO order
    entries: BTreeMap<u64, Tracked>,
    index: HashMap<MessageId, u64>,
    /// Sequences of `Pending` entries; every other live entry is in flight
    pending: BTreeSet<u64>,
    /// `ready_at` of pending entries and `visible_until` of delivered ones
    timers: BTreeSet<(Instant, u64)>,
    next_seq: u64,
    settled: SettledHistory,
}

impl Queue {
    pub(crate) fn new(id: QueueId, exclusive: bool, config: &BrokerConfig) -> Self {
        Self {
            id,
            exclusive,
            closed: false,
            capacity: config.max_queue_len,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            pending: BTreeSet::new(),
            timers: BTreeSet::new(),
            next_seq: 0,
            settled: SettledHistory::new(config.settled_history),
        }
    }

    pub(crate) fn id(&self) -> &QueueId {
        &self.id
    }

    pub(crate) fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.entries.len() - self.pending.len()
    }

    pub(crate) fn enqueue(&mut self, event: Event, now: Instant) {
        self.push(
            QueueEntry {
                event,
                delivery_state: DeliveryState::Pending,
                attempt_count: 0,
                last_attempt_at: None,
            },
            now,
        );
    }

    fn push(&mut self, entry: QueueEntry, ready_at: Instant) {
        let message_id = entry.event.message_id();
        if self.index.contains_key(&message_id) {
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(message_id, seq);
        self.pending.insert(seq);
        self.timers.insert((ready_at, seq));
        self.entries.insert(
            seq,
            Tracked {
                entry,
                ready_at,
                visible_until: None,
            },
        );
    }

    /// Hands out up to `max` ready entries in FIFO order, after failing expired deliveries.
    ///
    /// Returns the deliveries plus whatever had to be dead-lettered along the way.
    pub(crate) fn take_ready(
        &mut self,
        max: usize,
        now: Instant,
        config: &BrokerConfig,
    ) -> (Vec<Delivery>, Vec<DeadLetter>) {
        let dead = self.reap_expired(now, config);
        let due: Vec<u64> = self
            .pending
            .iter()
            .copied()
            .filter(|seq| self.entries.get(seq).is_some_and(|tracked| tracked.ready_at <= now))
            .take(max)
            .collect();

        let visible_until = now + config.visibility_timeout;
        let mut deliveries = Vec::with_capacity(due.len());
        for seq in due {
            let Some(tracked) = self.entries.get_mut(&seq) else {
                continue;
            };
            self.pending.remove(&seq);
            self.timers.remove(&(tracked.ready_at, seq));
            self.timers.insert((visible_until, seq));

            tracked.entry.attempt_count += 1;
            tracked.entry.delivery_state = DeliveryState::Delivered;
            tracked.entry.last_attempt_at = Some(Utc::now());
            tracked.visible_until = Some(visible_until);
            deliveries.push(Delivery::from_entry(&self.id, &tracked.entry));
        }

        (deliveries, dead)
    }

    /// Treats deliveries whose visibility timeout passed as failed (requeue with backoff, or dead
    /// letter once attempts are exhausted)
    pub(crate) fn reap_expired(&mut self, now: Instant, config: &BrokerConfig) -> Vec<DeadLetter> {
        let expired: Vec<(u64, Instant)> = self
            .timers
            .range(..=(now, u64::MAX))
            .filter(|(deadline, seq)| {
                self.entries
                    .get(seq)
                    .is_some_and(|tracked| tracked.visible_until == Some(*deadline))
            })
            .map(|(deadline, seq)| (*seq, *deadline))
            .collect();

        let mut dead = Vec::new();
        for (seq, deadline) in expired {
            if let Some(tracked) = self.entries.get(&seq) {
                warn!(
                    "visibility timeout expired for message {} on queue {} (attempt {})",
                    tracked.entry.event.message_id(),
                    self.id,
                    tracked.entry.attempt_count
                );
            }
            if let Some(Failure::DeadLettered(letter)) = self.fail(seq, deadline, true, config) {
                dead.push(letter);
            }
        }
        dead
    }

    pub(crate) fn ack(&mut self, message_id: &MessageId) -> AckOutcome {
        let Some(&seq) = self.index.get(message_id) else {
            return match self.settled.get(message_id) {
                Some(state) => AckOutcome::AlreadySettled(state),
                None => AckOutcome::Unknown,
            };
        };

        let Some(tracked) = self.entries.get(&seq) else {
            return AckOutcome::Unknown;
        };

        // A late ack (after the visibility timeout requeued the entry) still settles it
        let was_delivered = tracked.entry.delivery_state == DeliveryState::Delivered
            || tracked.entry.attempt_count > 0;
        if !was_delivered {
            return AckOutcome::NotDelivered;
        }

        self.remove(seq, DeliveryState::Acked);
        debug!("message {} acked on queue {}", message_id, self.id);
        AckOutcome::Acked
    }

    pub(crate) fn nack(
        &mut self,
        message_id: &MessageId,
        requeue: bool,
        now: Instant,
        config: &BrokerConfig,
    ) -> (NackOutcome, Option<DeadLetter>) {
        let Some(&seq) = self.index.get(message_id) else {
            let outcome = match self.settled.get(message_id) {
                Some(state) => NackOutcome::AlreadySettled(state),
                None => NackOutcome::Unknown,
            };
            return (outcome, None);
        };

        let delivered = self
            .entries
            .get(&seq)
            .is_some_and(|tracked| tracked.entry.delivery_state == DeliveryState::Delivered);
        if !delivered {
            return (NackOutcome::NotDelivered, None);
        }

        match self.fail(seq, now, requeue, config) {
            Some(Failure::Requeued(delay)) => (NackOutcome::Requeued { delay }, None),
            Some(Failure::DeadLettered(letter)) => {
                (NackOutcome::DeadLettered(letter.reason), Some(letter))
            }
            None => (NackOutcome::Unknown, None),
        }
    }

    /// Delivered -> Failed -> Pending (with backoff from `at`) or DeadLettered
    fn fail(&mut self, seq: u64, at: Instant, requeue: bool, config: &BrokerConfig) -> Option<Failure> {
        let tracked = self.entries.get_mut(&seq)?;
        tracked.entry.delivery_state = DeliveryState::Failed;
        if let Some(deadline) = tracked.visible_until.take() {
            self.timers.remove(&(deadline, seq));
        }

        let attempts = tracked.entry.attempt_count;
        if requeue && attempts < config.max_attempts {
            let delay = config.backoff_for(attempts);
            tracked.ready_at = at + delay;
            tracked.entry.delivery_state = DeliveryState::Pending;
            self.pending.insert(seq);
            self.timers.insert((tracked.ready_at, seq));
            debug!(
                "message {} requeued on queue {} after attempt {}, retry in {:?}",
                tracked.entry.event.message_id(),
                self.id,
                attempts,
                delay
            );
            return Some(Failure::Requeued(delay));
        }

        let reason = if requeue {
            DeadLetterReason::MaxAttemptsExceeded
        } else {
            DeadLetterReason::Rejected
        };
        let entry = self.remove(seq, DeliveryState::DeadLettered)?;
        warn!(
            "message {} dead-lettered on queue {} after {} attempts: {}",
            entry.event.message_id(),
            self.id,
            entry.attempt_count,
            reason
        );
        Some(Failure::DeadLettered(DeadLetter::new(self.id.clone(), entry, reason)))
    }

    fn remove(&mut self, seq: u64, terminal: DeliveryState) -> Option<QueueEntry> {
        let mut tracked = self.entries.remove(&seq)?;
        let message_id = tracked.entry.event.message_id();
        self.index.remove(&message_id);
        self.pending.remove(&seq);
        self.timers.remove(&(tracked.ready_at, seq));
        if let Some(deadline) = tracked.visible_until {
            self.timers.remove(&(deadline, seq));
        }
        tracked.entry.delivery_state = terminal;
        self.settled.record(message_id, terminal);
        Some(tracked.entry)
    }

    /// Earliest instant at which an entry becomes deliverable or a delivery expires
    pub(crate) fn next_wakeup(&self) -> Option<Instant> {
        self.timers.first().map(|(at, _)| *at)
    }

    pub(crate) fn state_of(&self, message_id: &MessageId) -> Option<DeliveryState> {
        self.index
            .get(message_id)
            .and_then(|seq| self.entries.get(seq))
            .map(|tracked| tracked.entry.delivery_state)
            .or_else(|| self.settled.get(message_id))
    }

    /// Marks the queue deleted and dead-letters every entry it still holds
    pub(crate) fn close(&mut self) -> Vec<DeadLetter> {
        self.closed = true;
        let id = self.id.clone();
        let seqs: Vec<u64> = self.entries.keys().copied().collect();

        seqs.into_iter()
            .filter_map(|seq| self.remove(seq, DeliveryState::DeadLettered))
            .map(|entry| DeadLetter::new(id.clone(), entry, DeadLetterReason::QueueDeleted))
            .collect()
    }

    /// Live entries in FIFO order, as persisted in a snapshot
    pub(crate) fn entries(&self) -> Vec<QueueEntry> {
        self.entries.values().map(|tracked| tracked.entry.clone()).collect()
    }

    /// Reloads persisted entries. In-flight deliveries from before the restart are made pending
    /// again, keeping their attempt counts; entries that already used up `max_attempts` are
    /// dead-lettered instead and returned.
    pub(crate) fn restore(
        &mut self,
        entries: Vec<QueueEntry>,
        now: Instant,
        config: &BrokerConfig,
    ) -> Vec<DeadLetter> {
        let mut dead = Vec::new();
        for mut entry in entries {
            match entry.delivery_state {
                DeliveryState::Acked | DeliveryState::DeadLettered => continue,
                _ if entry.attempt_count >= config.max_attempts => {
                    let message_id = entry.event.message_id();
                    warn!(
                        "message {} on queue {} restored after {} attempts, dead-lettering",
                        message_id, self.id, entry.attempt_count
                    );
                    entry.delivery_state = DeliveryState::DeadLettered;
                    self.settled.record(message_id, DeliveryState::DeadLettered);
                    dead.push(DeadLetter::new(
                        self.id.clone(),
                        entry,
                        DeadLetterReason::MaxAttemptsExceeded,
                    ));
                }
                _ => {
                    entry.delivery_state = DeliveryState::Pending;
                    self.push(entry, now);
                }
            }
        }
        dead
    }

    pub(crate) fn stats(&self, bindings: usize) -> QueueStats {
        QueueStats {
            queue_id: self.id.clone(),
            exclusive: self.exclusive,
            pending: self.pending(),
            in_flight: self.in_flight(),
            bindings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RoutingKey;

    fn config() -> BrokerConfig {
        BrokerConfig::default()
            .with_max_attempts(3)
            .with_visibility_timeout(Duration::from_secs(30))
    }

    fn queue() -> Queue {
        Queue::new(QueueId::new("q"), false, &config())
    }

    fn event(payload: &'static str) -> Event {
        Event::new("ex", RoutingKey::parse("product.created").unwrap(), payload)
    }

    #[test]
    fn test_take_ready_is_fifo_and_marks_delivered() {
        let now = Instant::now();
        let mut queue = queue();
        let first = event("a");
        let second = event("b");
        queue.enqueue(first.clone(), now);
        queue.enqueue(second.clone(), now);

        let (deliveries, dead) = queue.take_ready(1, now, &config());
        assert!(dead.is_empty());
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_id, first.message_id());
        assert_eq!(deliveries[0].attempt_count, 1);
        assert_eq!(queue.state_of(&first.message_id()), Some(DeliveryState::Delivered));

        let (deliveries, _) = queue.take_ready(10, now, &config());
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_id, second.message_id());
        assert_eq!(queue.in_flight(), 2);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_ack_removes_entry_and_is_idempotent() {
        let now = Instant::now();
        let mut queue = queue();
        let event = event("a");
        queue.enqueue(event.clone(), now);

        assert_eq!(queue.ack(&event.message_id()), AckOutcome::NotDelivered);
        queue.take_ready(1, now, &config());

        assert_eq!(queue.ack(&event.message_id()), AckOutcome::Acked);
        assert!(queue.is_empty());
        assert_eq!(
            queue.ack(&event.message_id()),
            AckOutcome::AlreadySettled(DeliveryState::Acked)
        );
        assert_eq!(queue.state_of(&event.message_id()), Some(DeliveryState::Acked));
        assert_eq!(queue.ack(&MessageId::new()), AckOutcome::Unknown);
    }

    #[test]
    fn test_nack_requeues_with_exponential_backoff_then_dead_letters() {
        let config = config();
        let mut now = Instant::now();
        let mut queue = queue();
        let event = event("a");
        queue.enqueue(event.clone(), now);

        for attempt in 1..=2u32 {
            let (deliveries, _) = queue.take_ready(1, now, &config);
            assert_eq!(deliveries[0].attempt_count, attempt);

            let (outcome, dead) = queue.nack(&event.message_id(), true, now, &config);
            let delay = config.backoff_for(attempt);
            assert_eq!(outcome, NackOutcome::Requeued { delay });
            assert!(dead.is_none());

            // not ready before the backoff elapses
            let (early, _) = queue.take_ready(1, now + delay - Duration::from_millis(1), &config);
            assert!(early.is_empty());
            assert_eq!(queue.next_wakeup(), Some(now + delay));
            now += delay;
        }

        queue.take_ready(1, now, &config);
        let (outcome, dead) = queue.nack(&event.message_id(), true, now, &config);
        assert_eq!(outcome, NackOutcome::DeadLettered(DeadLetterReason::MaxAttemptsExceeded));

        let letter = dead.unwrap();
        assert_eq!(letter.entry.attempt_count, 3);
        assert_eq!(letter.entry.delivery_state, DeliveryState::DeadLettered);
        assert!(queue.is_empty());
        assert_eq!(
            queue.nack(&event.message_id(), true, now, &config).0,
            NackOutcome::AlreadySettled(DeliveryState::DeadLettered)
        );
    }

    #[test]
    fn test_nack_without_requeue_rejects() {
        let now = Instant::now();
        let mut queue = queue();
        let event = event("a");
        queue.enqueue(event.clone(), now);
        queue.take_ready(1, now, &config());

        let (outcome, dead) = queue.nack(&event.message_id(), false, now, &config());
        assert_eq!(outcome, NackOutcome::DeadLettered(DeadLetterReason::Rejected));
        assert_eq!(dead.unwrap().entry.attempt_count, 1);
    }

    #[test]
    fn test_visibility_timeout_requeues_from_deadline() {
        let config = config();
        let now = Instant::now();
        let mut queue = queue();
        let event = event("a");
        queue.enqueue(event.clone(), now);
        queue.take_ready(1, now, &config);

        let deadline = now + config.visibility_timeout;
        assert_eq!(queue.next_wakeup(), Some(deadline));

        let (deliveries, _) = queue.take_ready(1, deadline, &config);
        assert!(deliveries.is_empty());
        assert_eq!(queue.state_of(&event.message_id()), Some(DeliveryState::Pending));

        let retry_at = deadline + config.backoff_for(1);
        let (deliveries, _) = queue.take_ready(1, retry_at, &config);
        assert_eq!(deliveries[0].attempt_count, 2);
        assert_eq!(queue.ack(&event.message_id()), AckOutcome::Acked);
    }

    #[test]
    fn test_late_ack_settles_requeued_entry() {
        let config = config();
        let now = Instant::now();
        let mut queue = queue();
        let event = event("a");
        queue.enqueue(event.clone(), now);
        queue.take_ready(1, now, &config);
        queue.reap_expired(now + config.visibility_timeout, &config);

        assert_eq!(
            queue.nack(&event.message_id(), true, now, &config).0,
            NackOutcome::NotDelivered
        );
        assert_eq!(queue.ack(&event.message_id()), AckOutcome::Acked);
    }

    #[test]
    fn test_capacity_and_close() {
        let config = config().with_max_queue_len(2);
        let now = Instant::now();
        let mut queue = Queue::new(QueueId::new("q"), true, &config);
        queue.enqueue(event("a"), now);
        assert!(!queue.is_full());
        queue.enqueue(event("b"), now);
        assert!(queue.is_full());

        let dead = queue.close();
        assert!(queue.is_closed());
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|letter| letter.reason == DeadLetterReason::QueueDeleted));
    }

    #[test]
    fn test_settled_history_is_bounded() {
        let config = config().with_settled_history(1);
        let now = Instant::now();
        let mut queue = Queue::new(QueueId::new("q"), false, &config);
        let first = event("a");
        let second = event("b");
        queue.enqueue(first.clone(), now);
        queue.enqueue(second.clone(), now);
        queue.take_ready(2, now, &config);
        queue.ack(&first.message_id());
        queue.ack(&second.message_id());

        assert_eq!(queue.ack(&first.message_id()), AckOutcome::Unknown);
        assert_eq!(
            queue.ack(&second.message_id()),
            AckOutcome::AlreadySettled(DeliveryState::Acked)
        );
    }

    #[test]
    fn test_restore_makes_delivered_entries_pending() {
        let config = config();
        let now = Instant::now();
        let mut original = queue();
        original.enqueue(event("a"), now);
        original.enqueue(event("b"), now);
        original.take_ready(1, now, &config);

        let mut restored = queue();
        assert!(restored.restore(original.entries(), now, &config).is_empty());
        assert_eq!(restored.pending(), 2);
        assert_eq!(restored.in_flight(), 0);

        let (deliveries, _) = restored.take_ready(2, now, &config);
        assert_eq!(deliveries[0].attempt_count, 2);
        assert_eq!(deliveries[1].attempt_count, 1);
    }

    #[test]
    fn test_restore_dead_letters_exhausted_deliveries() {
        let config = config();
        let mut now = Instant::now();
        let mut original = queue();
        let exhausted = event("a");
        let fresh = event("b");
        original.enqueue(exhausted.clone(), now);

        // the last allowed attempt is in flight when the snapshot is taken
        for _ in 1..config.max_attempts {
            original.take_ready(1, now, &config);
            original.nack(&exhausted.message_id(), true, now, &config);
            now += config.max_backoff;
        }
        let (deliveries, _) = original.take_ready(1, now, &config);
        assert_eq!(deliveries[0].attempt_count, config.max_attempts);
        original.enqueue(fresh.clone(), now);

        let mut restored = queue();
        let dead = restored.restore(original.entries(), now, &config);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::MaxAttemptsExceeded);
        assert_eq!(dead[0].entry.attempt_count, config.max_attempts);
        assert_eq!(dead[0].entry.delivery_state, DeliveryState::DeadLettered);
        assert_eq!(
            restored.state_of(&exhausted.message_id()),
            Some(DeliveryState::DeadLettered)
        );

        let (deliveries, _) = restored.take_ready(10, now, &config);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_id, fresh.message_id());
    }

    #[test]
    fn test_counters_and_wakeups_follow_every_transition() {
        let config = config();
        let now = Instant::now();
        let mut queue = queue();
        let (a, b, c) = (event("a"), event("b"), event("c"));
        for event in [&a, &b, &c] {
            queue.enqueue(event.clone(), now);
        }
        assert_eq!((queue.pending(), queue.in_flight()), (3, 0));
        assert_eq!(queue.next_wakeup(), Some(now));

        queue.take_ready(2, now, &config);
        assert_eq!((queue.pending(), queue.in_flight()), (1, 2));

        // a goes back with backoff, b is acked, c is still ready
        queue.nack(&a.message_id(), true, now, &config);
        queue.ack(&b.message_id());
        assert_eq!((queue.pending(), queue.in_flight()), (2, 0));
        assert_eq!(queue.next_wakeup(), Some(now));

        let (deliveries, _) = queue.take_ready(10, now, &config);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_id, c.message_id());
        assert_eq!(queue.next_wakeup(), Some(now + config.backoff_for(1)));

        // c times out and is requeued while a, past its backoff, goes out again
        let deadline = now + config.visibility_timeout;
        let (deliveries, dead) = queue.take_ready(10, deadline, &config);
        assert!(dead.is_empty());
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_id, a.message_id());
        assert_eq!((queue.pending(), queue.in_flight()), (1, 1));
        assert_eq!(queue.next_wakeup(), Some(deadline + config.backoff_for(1)));

        assert_eq!(queue.close().len(), 2);
        assert_eq!((queue.pending(), queue.in_flight()), (0, 0));
        assert_eq!(queue.next_wakeup(), None);
    }
}
