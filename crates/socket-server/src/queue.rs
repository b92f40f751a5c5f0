//! Blocking FIFO of [`WorkItem`]s shared between threads
//!
//! Every mutation happens under the queue's own mutex and every push signals
//! one waiter. Consumers either block until an item shows up ([`WorkQueue::pop`])
//! or give up on the first wake-up that finds the queue still empty
//! ([`WorkQueue::pop_or_wake`]); the latter is what lets a control connection
//! pull its transmit thread out of a wait during teardown.
//!
//! With a TTL configured, the queue sheds stale inbound datagrams each time its
//! length reaches a multiple of [`EVICTION_INTERVAL`]: everything older than
//! the TTL, measured against the receive time of the item being pushed, is
//! dropped before the new item is appended. Outbound items never expire.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::work_item::WorkItem;

/// Queue length step at which eviction runs and a milestone is logged
pub const EVICTION_INTERVAL: usize = 100;

/// Named, thread-safe FIFO with optional time-to-live eviction
pub struct WorkQueue {
    name: String,
    max_ttl: f64,
    items: Mutex<VecDeque<WorkItem>>,
    cond: Condvar,
}

impl WorkQueue {
    /// Create a queue without eviction
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_ttl(name, 0.0)
    }

    /// Create a queue whose inbound items expire after `max_ttl` seconds.
    ///
    /// A TTL of zero (or less) disables eviction.
    pub fn with_ttl(name: impl Into<String>, max_ttl: f64) -> Self {
        Self {
            name: name.into(),
            max_ttl,
            items: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured TTL in seconds, zero when disabled
    pub fn max_ttl(&self) -> f64 {
        self.max_ttl.max(0.0)
    }

    /// Current number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Append an item at the tail and wake one waiter
    pub fn push(&self, item: WorkItem) {
        let mut items = self.items.lock();

        if (items.len() + 1) % EVICTION_INTERVAL == 0 {
            if let Some(now) = item.received_at() {
                self.evict_stale(&mut items, now);
            }
        }

        items.push_back(item);
        let length = items.len();
        if length >= EVICTION_INTERVAL && length % EVICTION_INTERVAL == 0 {
            warn!("queue({}): length {}", self.name, length);
        }

        self.cond.notify_one();
    }

    /// Put an item back at the head, ahead of everything already queued.
    ///
    /// Used when a consumer took an item but could not deliver it.
    pub fn requeue(&self, item: WorkItem) {
        let mut items = self.items.lock();
        items.push_front(item);
        self.cond.notify_one();
    }

    /// Remove and return the head, blocking for as long as the queue is empty
    pub fn pop(&self) -> WorkItem {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.cond.wait(&mut items);
        }
    }

    /// Remove and return the head, or `None` if a wake-up finds the queue empty.
    ///
    /// Spurious wake-ups also return `None`; callers are expected to check
    /// their own shutdown condition and call again.
    pub fn pop_or_wake(&self) -> Option<WorkItem> {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.cond.wait(&mut items);
        }
        items.pop_front()
    }

    /// Wake every thread waiting on this queue without giving them an item
    pub fn wake_all(&self) {
        let _items = self.items.lock();
        self.cond.notify_all();
    }

    fn evict_stale(&self, items: &mut VecDeque<WorkItem>, now: f64) {
        if self.max_ttl <= 0.0 || items.is_empty() {
            return;
        }
        let cutoff = now - self.max_ttl;
        let before = items.len();
        items.retain(|queued| match queued {
            WorkItem::Inbound(packet) => packet.received_at >= cutoff,
            WorkItem::Outbound(_) => true,
        });
        let evicted = before - items.len();
        if evicted > 0 {
            debug!("queue({}): evicted {} stale items", self.name, evicted);
        }
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("max_ttl", &self.max_ttl)
            .field("len", &self.len())
            .finish()
    }
}
