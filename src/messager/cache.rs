//! Bounded cache of pending and in-flight messages for one table.

use std::collections::HashSet;

use super::queue::PriorityQueue;
use super::row::MessageRow;

/// Outcome of [`MessageCache::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAdd {
    Added,
    /// Already queued or in flight; the row was not re-added
    Duplicate,
    /// The pending queue is at capacity
    Full,
}

/// Pending messages wait in a [`PriorityQueue`]; popped messages move to the
/// in-flight set until they are discarded.
#[derive(Debug)]
pub struct MessageCache {
    capacity: usize,
    pending: PriorityQueue,
    in_flight: HashSet<String>,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: PriorityQueue::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn add(&mut self, row: MessageRow) -> CacheAdd {
        let key = row.key();
        if self.in_flight.contains(&key) || self.pending.contains(&key) {
            return CacheAdd::Duplicate;
        }
        if self.pending.len() >= self.capacity {
            return CacheAdd::Full;
        }
        self.pending.push(row);
        CacheAdd::Added
    }

    /// Take the next message and mark it in flight.
    pub fn pop(&mut self) -> Option<MessageRow> {
        let row = self.pending.pop()?;
        self.in_flight.insert(row.key());
        Some(row)
    }

    /// Forget messages entirely, pending or in flight.
    pub fn discard<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        let mut removed = 0;
        for key in keys {
            let was_in_flight = self.in_flight.remove(key);
            let was_pending = self.pending.remove(key).is_some();
            if was_in_flight || was_pending {
                removed += 1;
            }
        }
        removed
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pending messages.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight.clear();
    }
}
