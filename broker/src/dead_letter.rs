use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{QueueEntry, QueueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterReason {
    /// Every allowed delivery attempt failed
    MaxAttemptsExceeded,
    /// The consumer nacked without requeue
    Rejected,
    /// The queue was deleted while the entry was still pending
    QueueDeleted,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::MaxAttemptsExceeded => "max attempts exceeded",
            Self::Rejected => "rejected",
            Self::QueueDeleted => "queue deleted",
        };
        f.write_str(reason)
    }
}

/// Entry that left its queue without being acked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub queue_id: QueueId,
    pub entry: QueueEntry,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(queue_id: QueueId, entry: QueueEntry, reason: DeadLetterReason) -> Self {
        Self {
            queue_id,
            entry,
            reason,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Terminal destination of dead-lettered entries, kept for operator inspection.
///
/// `accept` runs inline on publish, ack and sweep paths, so implementations must not block.
pub trait DeadLetterSink: Send + Sync {
    fn accept(&self, dead_letter: DeadLetter);

    fn dead_letters(&self) -> Vec<DeadLetter>;
}

/// Bounded in-memory sink; evicts the oldest dead letter once full
#[derive(Debug)]
pub struct InMemoryDeadLetterSink {
    capacity: usize,
    letters: Mutex<VecDeque<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            letters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn accept(&self, dead_letter: DeadLetter) {
        let mut letters = self.letters.lock();
        if letters.len() >= self.capacity {
            if let Some(evicted) = letters.pop_front() {
                warn!(
                    "dead letter sink full, evicting message {} from queue {}",
                    evicted.entry.event.message_id(),
                    evicted.queue_id
                );
            }
        }
        letters.push_back(dead_letter);
    }

    fn dead_letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().iter().cloned().collect()
    }
}
