//! Durable storage surface used by the messager.
//!
//! The messager never owns its storage. It reaches rows only through the
//! [`QueryExecutor`] trait, which executes statements produced by the
//! [`AckGenerator`](crate::messager::AckGenerator).
//!
//! - `MemoryMessageStore`: in-process tables (tests, local runs)
//! - `PostgresMessageStore`: PostgreSQL through an sqlx pool

pub mod memory_backend;
pub mod pool;
pub mod postgres_backend;

use async_trait::async_trait;
use thiserror::Error;

use crate::messager::BoundQuery;
use crate::types::QueryResult;

pub use memory_backend::{MemoryMessageStore, StoredMessage};
pub use pool::{PostgresPool, PostgresPoolError};
pub use postgres_backend::PostgresMessageStore;

/// Errors that can occur while executing a statement.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend is temporarily unavailable
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// PostgreSQL operation failed
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A column type the row decoder does not handle
    #[error("unsupported column type {type_name} for column {column}")]
    UnsupportedType { column: String, type_name: String },

    /// Fault injected by a test store
    #[error("injected failure: {0}")]
    Injected(String),
}

/// The SQL/row execution surface.
///
/// # Thread Safety
///
/// Implementations are shared by every manager's background tasks and must
/// be `Send + Sync`.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute `query`, returning at most `max_rows` rows (0 means no limit).
    /// Field metadata is populated only when `want_fields` is set.
    async fn execute_fetch(
        &self,
        query: &BoundQuery,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, StorageError>;

    /// Backend type identifier
    fn backend_type(&self) -> &'static str;
}
