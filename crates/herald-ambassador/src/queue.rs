//! ---
//! herald_section: "04-publishing-resilience"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Circuit breaker, failed-message queue, and publishing facade."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
//! Bounded FIFO of messages waiting for redelivery. In-memory only; the
//! contents are lost when the process exits.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use herald_common::config::OverflowPolicy;
use parking_lot::Mutex;

/// A message that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMessage {
    /// Raw payload as handed to `publish`.
    pub payload: Bytes,
    /// Channel the payload was meant for.
    pub channel: String,
    /// When the message first entered the queue.
    pub enqueued_at: DateTime<Utc>,
}

impl FailedMessage {
    /// Stamp a payload with the current time.
    pub fn new(channel: impl Into<String>, payload: Bytes) -> Self {
        Self {
            payload,
            channel: channel.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Outcome of offering a message to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Stored without displacing anything.
    Queued,
    /// Stored; the returned oldest entry was evicted to make room.
    Evicted(FailedMessage),
    /// Not stored because the queue is full.
    Refused(FailedMessage),
}

impl Admission {
    /// Whether a message was lost to make this admission.
    pub fn dropped(&self) -> bool {
        !matches!(self, Admission::Queued)
    }
}

struct Slots {
    entries: VecDeque<FailedMessage>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl Slots {
    fn admit(&mut self, message: FailedMessage) -> Admission {
        if self.entries.len() < self.capacity {
            self.entries.push_back(message);
            return Admission::Queued;
        }
        match self.policy {
            OverflowPolicy::DropNewest => Admission::Refused(message),
            OverflowPolicy::DropOldest => {
                let evicted = self.entries.pop_front();
                self.entries.push_back(message);
                match evicted {
                    Some(evicted) => Admission::Evicted(evicted),
                    None => Admission::Queued,
                }
            }
        }
    }
}

/// Failed-message queue with an explicit overflow policy.
pub struct FailedQueue {
    slots: Mutex<Slots>,
    total_dropped: AtomicU64,
}

impl FailedQueue {
    /// Create an empty queue. A zero capacity is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Slots {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                policy,
            }),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Append a message at the tail.
    pub fn enqueue(&self, message: FailedMessage) -> Admission {
        let admission = self.slots.lock().admit(message);
        if admission.dropped() {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
        admission
    }

    /// Remove and return every queued message, oldest first.
    pub fn take_all(&self) -> Vec<FailedMessage> {
        self.slots.lock().entries.drain(..).collect()
    }

    /// Append messages that failed another delivery attempt, keeping their
    /// relative order. Returns how many were lost to the overflow policy.
    pub fn requeue(&self, messages: Vec<FailedMessage>) -> u64 {
        if messages.is_empty() {
            return 0;
        }
        let mut slots = self.slots.lock();
        let dropped = messages
            .into_iter()
            .map(|message| slots.admit(message))
            .filter(Admission::dropped)
            .count() as u64;
        drop(slots);
        if dropped > 0 {
            self.total_dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        dropped
    }

    /// Change capacity and policy; excess oldest entries are discarded.
    /// Returns how many entries were discarded.
    pub fn reconfigure(&self, capacity: usize, policy: OverflowPolicy) -> u64 {
        let capacity = capacity.max(1);
        let mut slots = self.slots.lock();
        slots.capacity = capacity;
        slots.policy = policy;
        let excess = slots.entries.len().saturating_sub(capacity);
        slots.entries.drain(..excess);
        drop(slots);
        let excess = excess as u64;
        if excess > 0 {
            self.total_dropped.fetch_add(excess, Ordering::Relaxed);
        }
        excess
    }

    /// Copy of the queued messages, oldest first.
    pub fn peek(&self) -> Vec<FailedMessage> {
        self.slots.lock().entries.iter().cloned().collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().entries.is_empty()
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity
    }

    /// Messages lost to the overflow policy since creation.
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FailedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("FailedQueue")
            .field("len", &slots.entries.len())
            .field("capacity", &slots.capacity)
            .field("policy", &slots.policy)
            .field("total_dropped", &self.total_dropped())
            .finish()
    }
}
