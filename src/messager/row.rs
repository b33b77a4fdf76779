use crate::error::{MessagerError, Result};
use crate::types::Value;

/// One message as held by a manager.
///
/// The retry bookkeeping lives on the row itself so the delivery state of a
/// message can always be read off its own columns.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub priority: i64,
    /// Unix nanos at which the message is (next) due
    pub time_next: i64,
    /// Delivery attempts so far
    pub epoch: i64,
    pub time_acked: Option<i64>,
    /// Delivered columns: `id` first, then the payload
    pub row: Vec<Value>,
}

impl MessageRow {
    /// A message due immediately with default priority.
    pub fn new(row: Vec<Value>) -> Self {
        Self {
            priority: 0,
            time_next: 0,
            epoch: 0,
            time_acked: None,
            row,
        }
    }

    pub fn id(&self) -> Option<&Value> {
        self.row.first()
    }

    /// Identifier key used for cache bookkeeping.
    pub fn key(&self) -> String {
        self.id().map(Value::to_key).unwrap_or_default()
    }

    /// Decode a row produced by the load statement:
    /// `priority, time_next, epoch, time_acked, id, payload...`.
    pub fn from_load_row(mut values: Vec<Value>) -> Result<Self> {
        if values.len() < 5 {
            return Err(MessagerError::InvalidArgument(format!(
                "message row has {} columns, expected at least 5",
                values.len()
            )));
        }
        let row = values.split_off(4);
        let int = |idx: usize, name: &str| {
            values[idx].as_i64().ok_or_else(|| {
                MessagerError::InvalidArgument(format!("{} is not an integer: {}", name, values[idx]))
            })
        };

        Ok(Self {
            priority: int(0, "priority")?,
            time_next: int(1, "time_next")?,
            epoch: int(2, "epoch")?,
            time_acked: values[3].as_i64(),
            row,
        })
    }
}
