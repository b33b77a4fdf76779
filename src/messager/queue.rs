//! Priority queue of cached messages.

use std::collections::{BTreeMap, HashMap};

use crate::types::IdKey;

use super::row::MessageRow;

/// Ordering key: lower priority value first, then earlier `time_next`, then id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: i64,
    time_next: i64,
    id: IdKey,
}

impl QueueKey {
    fn of(row: &MessageRow) -> Self {
        Self {
            priority: row.priority,
            time_next: row.time_next,
            id: row.id().map(IdKey::from).unwrap_or(IdKey::Null),
        }
    }
}

/// Messages ordered by `(priority, time_next, id)`.
///
/// Backed by an ordered map plus an id index, so push, pop, remove and
/// reschedule are all O(log n).
#[derive(Debug, Default)]
pub struct PriorityQueue {
    order: BTreeMap<QueueKey, MessageRow>,
    index: HashMap<String, QueueKey>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row. Returns false if a row with the same id is present.
    pub fn push(&mut self, row: MessageRow) -> bool {
        let id = row.key();
        if self.index.contains_key(&id) {
            return false;
        }
        let key = QueueKey::of(&row);
        self.index.insert(id, key.clone());
        self.order.insert(key, row);
        true
    }

    pub fn peek(&self) -> Option<&MessageRow> {
        self.order.first_key_value().map(|(_, row)| row)
    }

    pub fn pop(&mut self) -> Option<MessageRow> {
        let (_, row) = self.order.pop_first()?;
        self.index.remove(&row.key());
        Some(row)
    }

    pub fn remove(&mut self, id: &str) -> Option<MessageRow> {
        let key = self.index.remove(id)?;
        self.order.remove(&key)
    }

    /// Move a queued message to a new scheduled time.
    pub fn reschedule(&mut self, id: &str, time_next: i64) -> bool {
        match self.remove(id) {
            Some(mut row) => {
                row.time_next = time_next;
                self.push(row)
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn row(id: &str, priority: i64, time_next: i64) -> MessageRow {
        MessageRow {
            priority,
            time_next,
            ..MessageRow::new(vec![Value::text(id)])
        }
    }

    fn drain(queue: &mut PriorityQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop()).map(|r| r.key()).collect()
    }

    #[test]
    fn test_orders_by_priority_time_then_id() {
        let mut queue = PriorityQueue::new();
        queue.push(row("late", 0, 20));
        queue.push(row("low", 5, 1));
        queue.push(row("b", 0, 10));
        queue.push(row("a", 0, 10));

        assert_eq!(queue.peek().map(|r| r.key()), Some("a".to_string()));
        assert_eq!(drain(&mut queue), vec!["a", "b", "late", "low"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_integer_ids_tie_break_numerically() {
        let mut queue = PriorityQueue::new();
        for id in [10, 9, 2] {
            queue.push(MessageRow::new(vec![Value::Int64(id)]));
        }
        assert_eq!(drain(&mut queue), vec!["2", "9", "10"]);

        assert!(queue.push(MessageRow::new(vec![Value::Int64(7)])));
        assert!(!queue.push(MessageRow::new(vec![Value::Int64(7)])));
        assert!(queue.remove("7").is_some());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut queue = PriorityQueue::new();
        assert!(queue.push(row("1", 0, 10)));
        assert!(!queue.push(row("1", 0, 5)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_and_reschedule() {
        let mut queue = PriorityQueue::new();
        queue.push(row("1", 0, 10));
        queue.push(row("2", 0, 20));

        assert!(queue.reschedule("1", 30));
        assert_eq!(drain(&mut queue), vec!["2", "1"]);

        queue.push(row("3", 0, 1));
        assert!(queue.remove("3").is_some());
        assert!(queue.remove("3").is_none());
        assert!(!queue.reschedule("3", 5));
        assert!(!queue.contains("3"));
    }
}
