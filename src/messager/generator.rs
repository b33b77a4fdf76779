//! Statement generation for message tables.
//!
//! Every statement is produced twice: as parameterised SQL for a real
//! database and as a typed [`MessageStatement`] that in-process stores can
//! evaluate directly. Generation is a pure function of the table layout and
//! the inputs; times are passed in by the caller.

use std::sync::Arc;

use crate::config::MessagerConfig;
use crate::error::{MessagerError, Result};
use crate::schema::{
    MessageInfo, TableDescriptor, COL_EPOCH, COL_ID, COL_PRIORITY, COL_TIME_ACKED, COL_TIME_NEXT,
};
use crate::types::{Field, FieldType, Value};

/// Typed form of a generated statement.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageStatement {
    /// Select due, unacked rows ordered by (priority, time_next, id)
    Load { time_now: i64, limit: usize },
    /// Permanently acknowledge
    Ack { ids: Vec<Value>, time_acked: i64 },
    /// Fail-and-reschedule: move `time_next` and bump `epoch`
    Reschedule { ids: Vec<Value>, time_next: i64 },
    /// Give up on messages past their max epoch
    Expire { ids: Vec<Value>, time_acked: i64 },
    /// Delete acked rows older than the cutoff
    Purge { acked_before: i64, limit: usize },
}

impl MessageStatement {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageStatement::Load { .. } => "load",
            MessageStatement::Ack { .. } => "ack",
            MessageStatement::Reschedule { .. } => "reschedule",
            MessageStatement::Expire { .. } => "expire",
            MessageStatement::Purge { .. } => "purge",
        }
    }
}

/// A statement bound to its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub table: String,
    pub statement: MessageStatement,
    /// SQL with `$n` placeholders
    pub sql: String,
    pub params: Vec<Value>,
}

/// Builds ack, reschedule, expire, purge and load statements for one table.
#[derive(Debug, Clone)]
pub struct AckGenerator {
    info: Arc<MessageInfo>,
}

impl AckGenerator {
    /// Fails with `InvalidArgument` if the descriptor lacks message columns.
    pub fn new(descriptor: &TableDescriptor, defaults: &MessagerConfig) -> Result<Self> {
        Ok(Self::from_info(Arc::new(MessageInfo::resolve(
            descriptor, defaults,
        )?)))
    }

    pub fn from_info(info: Arc<MessageInfo>) -> Self {
        Self { info }
    }

    pub fn table(&self) -> &str {
        &self.info.table
    }

    pub fn info(&self) -> &Arc<MessageInfo> {
        &self.info
    }

    /// Columns delivered to receivers.
    pub fn fields(&self) -> &[Field] {
        &self.info.fields
    }

    /// Columns returned by the load statement: the four bookkeeping columns
    /// followed by [`fields`](Self::fields).
    pub fn load_fields(&self) -> Vec<Field> {
        let mut fields = vec![
            Field::new(COL_PRIORITY, FieldType::Int64),
            Field::new(COL_TIME_NEXT, FieldType::Int64),
            Field::new(COL_EPOCH, FieldType::Int64),
            Field::new(COL_TIME_ACKED, FieldType::Int64),
        ];
        fields.extend(self.info.fields.iter().cloned());
        fields
    }

    pub fn generate_load(&self, time_now: i64, limit: usize) -> BoundQuery {
        let columns = self
            .load_fields()
            .iter()
            .map(|f| quote(&f.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE {time_next} <= $1 AND {time_acked} IS NULL \
             ORDER BY {priority}, {time_next}, {id} LIMIT $2",
            columns = columns,
            table = quote(&self.info.table),
            time_next = quote(COL_TIME_NEXT),
            time_acked = quote(COL_TIME_ACKED),
            priority = quote(COL_PRIORITY),
            id = quote(COL_ID),
        );
        BoundQuery {
            table: self.info.table.clone(),
            statement: MessageStatement::Load { time_now, limit },
            sql,
            params: vec![Value::Int64(time_now), Value::Int64(limit as i64)],
        }
    }

    pub fn generate_ack(&self, ids: &[Value], time_acked: i64) -> Result<BoundQuery> {
        let ids = validate_ids(ids)?;
        Ok(self.mark_acked(
            MessageStatement::Ack {
                ids: ids.clone(),
                time_acked,
            },
            ids,
            time_acked,
        ))
    }

    /// Fail-and-reschedule: the messages become due again at `time_next`
    /// with their epoch incremented.
    pub fn generate_reschedule(&self, ids: &[Value], time_next: i64) -> Result<BoundQuery> {
        let ids = validate_ids(ids)?;
        let (in_list, mut params) = in_clause(&ids, 2);
        params.insert(0, Value::Int64(time_next));
        let sql = format!(
            "UPDATE {table} SET {time_next} = $1, {epoch} = {epoch} + 1 \
             WHERE {id} IN ({in_list}) AND {time_acked} IS NULL",
            table = quote(&self.info.table),
            time_next = quote(COL_TIME_NEXT),
            epoch = quote(COL_EPOCH),
            id = quote(COL_ID),
            in_list = in_list,
            time_acked = quote(COL_TIME_ACKED),
        );
        Ok(BoundQuery {
            table: self.info.table.clone(),
            statement: MessageStatement::Reschedule { ids, time_next },
            sql,
            params,
        })
    }

    pub fn generate_expire(&self, ids: &[Value], time_acked: i64) -> Result<BoundQuery> {
        let ids = validate_ids(ids)?;
        Ok(self.mark_acked(
            MessageStatement::Expire {
                ids: ids.clone(),
                time_acked,
            },
            ids,
            time_acked,
        ))
    }

    pub fn generate_purge(&self, acked_before: i64, limit: usize) -> BoundQuery {
        let sql = format!(
            "DELETE FROM {table} WHERE {id} IN \
             (SELECT {id} FROM {table} WHERE {time_acked} < $1 LIMIT $2)",
            table = quote(&self.info.table),
            id = quote(COL_ID),
            time_acked = quote(COL_TIME_ACKED),
        );
        BoundQuery {
            table: self.info.table.clone(),
            statement: MessageStatement::Purge {
                acked_before,
                limit,
            },
            sql,
            params: vec![Value::Int64(acked_before), Value::Int64(limit as i64)],
        }
    }

    fn mark_acked(&self, statement: MessageStatement, ids: Vec<Value>, time_acked: i64) -> BoundQuery {
        let (in_list, mut params) = in_clause(&ids, 2);
        params.insert(0, Value::Int64(time_acked));
        let sql = format!(
            "UPDATE {table} SET {time_acked} = $1, {time_next} = NULL \
             WHERE {id} IN ({in_list}) AND {time_acked} IS NULL",
            table = quote(&self.info.table),
            time_acked = quote(COL_TIME_ACKED),
            time_next = quote(COL_TIME_NEXT),
            id = quote(COL_ID),
            in_list = in_list,
        );
        BoundQuery {
            table: self.info.table.clone(),
            statement,
            sql,
            params,
        }
    }
}

fn validate_ids(ids: &[Value]) -> Result<Vec<Value>> {
    if ids.is_empty() {
        return Err(MessagerError::InvalidArgument(
            "empty message id batch".to_string(),
        ));
    }
    if ids.iter().any(Value::is_null) {
        return Err(MessagerError::InvalidArgument(
            "message id cannot be NULL".to_string(),
        ));
    }
    Ok(ids.to_vec())
}

/// Placeholders `$first..` for each id, plus the ids as params.
fn in_clause(ids: &[Value], first: usize) -> (String, Vec<Value>) {
    let placeholders = (0..ids.len())
        .map(|i| format!("${}", first + i))
        .collect::<Vec<_>>()
        .join(", ");
    (placeholders, ids.to_vec())
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
