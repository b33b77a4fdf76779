//! In-memory message store using DashMap.
//!
//! Evaluates the typed form of generated statements directly, so it needs no
//! SQL parsing. Rows are lost on restart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::messager::{now_nanos, BoundQuery, MessageRow, MessageStatement};
use crate::types::{IdKey, QueryResult, Value};

use super::{QueryExecutor, StorageError};

/// A durable message row as the store keeps it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: Value,
    pub priority: i64,
    /// `None` once acknowledged
    pub time_next: Option<i64>,
    pub epoch: i64,
    pub time_acked: Option<i64>,
    /// Columns after `id`
    pub payload: Vec<Value>,
}

impl StoredMessage {
    /// A new message due now with default priority.
    pub fn new(id: impl Into<Value>, payload: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            time_next: Some(now_nanos()),
            epoch: 0,
            time_acked: None,
            payload,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_time_next(mut self, time_next: i64) -> Self {
        self.time_next = Some(time_next);
        self
    }

    pub fn is_acked(&self) -> bool {
        self.time_acked.is_some()
    }

    /// The cache form of this row, as the write path would push it.
    pub fn to_row(&self) -> MessageRow {
        let mut values = Vec::with_capacity(self.payload.len() + 1);
        values.push(self.id.clone());
        values.extend(self.payload.iter().cloned());
        MessageRow {
            priority: self.priority,
            time_next: self.time_next.unwrap_or_default(),
            epoch: self.epoch,
            time_acked: self.time_acked,
            row: values,
        }
    }

    fn load_row(&self) -> Vec<Value> {
        let mut values = vec![
            Value::Int64(self.priority),
            self.time_next.into(),
            Value::Int64(self.epoch),
            self.time_acked.into(),
            self.id.clone(),
        ];
        values.extend(self.payload.iter().cloned());
        values
    }
}

/// In-memory message store.
pub struct MemoryMessageStore {
    /// table -> id key -> message
    tables: DashMap<String, BTreeMap<String, StoredMessage>>,
    /// Remaining statements to fail
    fail_next: AtomicUsize,
    /// Executed statement counts by kind
    executed: DashMap<&'static str, usize>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            fail_next: AtomicUsize::new(0),
            executed: DashMap::new(),
        }
    }

    /// Insert or replace a message.
    pub fn insert(&self, table: &str, message: StoredMessage) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(message.id.to_key(), message);
    }

    pub fn get(&self, table: &str, id: &str) -> Option<StoredMessage> {
        self.tables
            .get(table)
            .and_then(|rows| rows.get(id).cloned())
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Make the next `count` statements fail with a storage error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of executed statements of the given kind.
    pub fn executed(&self, kind: &str) -> usize {
        self.executed.get(kind).map(|c| *c).unwrap_or(0)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn load(&self, table: &str, time_now: i64, limit: usize) -> QueryResult {
        let rows = match self.tables.get(table) {
            Some(rows) => rows,
            None => return QueryResult::default(),
        };
        let mut due: Vec<&StoredMessage> = rows
            .values()
            .filter(|m| m.time_acked.is_none() && m.time_next.is_some_and(|t| t <= time_now))
            .collect();
        due.sort_by(|a, b| {
            (a.priority, a.time_next, IdKey::from(&a.id))
                .cmp(&(b.priority, b.time_next, IdKey::from(&b.id)))
        });

        QueryResult {
            rows: due.into_iter().take(limit).map(StoredMessage::load_row).collect(),
            ..Default::default()
        }
    }

    fn update<F>(&self, table: &str, ids: &[Value], mut apply: F) -> u64
    where
        F: FnMut(&mut StoredMessage),
    {
        let mut affected = 0;
        if let Some(mut rows) = self.tables.get_mut(table) {
            for id in ids {
                if let Some(message) = rows.get_mut(&id.to_key()) {
                    if message.time_acked.is_none() {
                        apply(message);
                        affected += 1;
                    }
                }
            }
        }
        affected
    }

    fn purge(&self, table: &str, acked_before: i64, limit: usize) -> u64 {
        let mut purged = 0;
        if let Some(mut rows) = self.tables.get_mut(table) {
            let victims: Vec<String> = rows
                .iter()
                .filter(|(_, m)| m.time_acked.is_some_and(|t| t < acked_before))
                .map(|(key, _)| key.clone())
                .take(limit)
                .collect();
            for key in victims {
                rows.remove(&key);
                purged += 1;
            }
        }
        purged
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryExecutor for MemoryMessageStore {
    // Field metadata is not tracked here; callers own the layout.
    async fn execute_fetch(
        &self,
        query: &BoundQuery,
        max_rows: usize,
        _want_fields: bool,
    ) -> Result<QueryResult, StorageError> {
        *self.executed.entry(query.statement.kind()).or_insert(0) += 1;

        if self.take_injected_failure() {
            return Err(StorageError::Injected(format!(
                "{} on {}",
                query.statement.kind(),
                query.table
            )));
        }

        let result = match &query.statement {
            MessageStatement::Load { time_now, limit } => {
                let limit = if max_rows > 0 {
                    (*limit).min(max_rows)
                } else {
                    *limit
                };
                self.load(&query.table, *time_now, limit)
            }
            MessageStatement::Ack { ids, time_acked }
            | MessageStatement::Expire { ids, time_acked } => {
                QueryResult::affected(self.update(&query.table, ids, |m| {
                    m.time_acked = Some(*time_acked);
                    m.time_next = None;
                }))
            }
            MessageStatement::Reschedule { ids, time_next } => {
                QueryResult::affected(self.update(&query.table, ids, |m| {
                    m.time_next = Some(*time_next);
                    m.epoch += 1;
                }))
            }
            MessageStatement::Purge {
                acked_before,
                limit,
            } => QueryResult::affected(self.purge(&query.table, *acked_before, *limit)),
        };

        Ok(result)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
