//! PostgreSQL-backed message storage.
//!
//! Executes the SQL form of generated statements against message tables that
//! live in PostgreSQL. Table layout:
//!
//! ```sql
//! CREATE TABLE orders_queue (
//!     id         BIGINT PRIMARY KEY,
//!     priority   BIGINT NOT NULL DEFAULT 0,
//!     time_next  BIGINT,
//!     epoch      BIGINT NOT NULL DEFAULT 0,
//!     time_acked BIGINT,
//!     message    JSONB
//! );
//! COMMENT ON TABLE orders_queue IS 'vitess_message,vt_ack_wait=30';
//! ```

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};

use crate::messager::{BoundQuery, MessageStatement};
use crate::types::{Field, FieldType, QueryResult, Value};

use super::{PostgresPool, QueryExecutor, StorageError};

pub struct PostgresMessageStore {
    pool: PostgresPool,
}

impl PostgresMessageStore {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PostgresPool {
        &self.pool
    }
}

#[async_trait]
impl QueryExecutor for PostgresMessageStore {
    async fn execute_fetch(
        &self,
        query: &BoundQuery,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, StorageError> {
        let mut statement = sqlx::query(&query.sql);
        for param in &query.params {
            statement = bind_value(statement, param)?;
        }

        if let MessageStatement::Load { .. } = query.statement {
            let pg_rows = statement.fetch_all(self.pool.pool()).await?;

            let fields = match (want_fields, pg_rows.first()) {
                (true, Some(first)) => describe(first),
                _ => Vec::new(),
            };

            let take = if max_rows > 0 { max_rows } else { pg_rows.len() };
            let rows = pg_rows
                .iter()
                .take(take)
                .map(decode_row)
                .collect::<Result<Vec<_>, _>>()?;

            tracing::trace!(
                table = %query.table,
                rows = rows.len(),
                "Loaded message rows from PostgreSQL"
            );

            return Ok(QueryResult {
                fields,
                rows,
                rows_affected: 0,
            });
        }

        let result = statement.execute(self.pool.pool()).await?;
        Ok(QueryResult::affected(result.rows_affected()))
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Result<Query<'q, Postgres, PgArguments>, StorageError> {
    Ok(match value {
        Value::Null => query.bind(None::<i64>),
        Value::Int64(v) => query.bind(*v),
        Value::UInt64(v) => {
            let v = i64::try_from(*v).map_err(|_| StorageError::UnsupportedType {
                column: "$param".to_string(),
                type_name: format!("UInt64({}) out of BIGINT range", v),
            })?;
            query.bind(v)
        }
        Value::Float64(v) => query.bind(*v),
        Value::Text(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
    })
}

fn field_type(type_name: &str) -> FieldType {
    match type_name {
        "INT2" | "INT4" | "INT8" | "BOOL" => FieldType::Int64,
        "FLOAT4" | "FLOAT8" => FieldType::Float64,
        "BYTEA" => FieldType::Bytes,
        "JSON" | "JSONB" => FieldType::Json,
        _ => FieldType::Text,
    }
}

fn describe(row: &PgRow) -> Vec<Field> {
    row.columns()
        .iter()
        .map(|c| Field::new(c.name(), field_type(c.type_info().name())))
        .collect()
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>, StorageError> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| decode_column(row, idx, column.name(), column.type_info().name()))
        .collect()
}

fn decode_column(
    row: &PgRow,
    idx: usize,
    column: &str,
    type_name: &str,
) -> Result<Value, StorageError> {
    let value = match type_name {
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| Value::Int64(v.into())),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| Value::Int64(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int64),
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)?
            .map(|v| Value::Int64(v.into())),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| Value::Float64(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float64),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(idx)?.map(Value::Text)
        }
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(idx)?.map(Value::Bytes),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)?
            .map(|v| Value::Text(v.to_string())),
        other => {
            return Err(StorageError::UnsupportedType {
                column: column.to_string(),
                type_name: other.to_string(),
            })
        }
    };
    Ok(value.unwrap_or(Value::Null))
}
