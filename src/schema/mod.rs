//! Schema metadata consumed by the messager.
//!
//! - `table`: table descriptors, message options and the resolved message layout
//! - `engine`: the schema-change feed that notifies subscribers
//! - `batch`: DDL batching helpers

pub mod batch;
pub mod engine;
pub mod table;

pub use batch::{all_sqls_are_create_queries, batch_sqls};
pub use engine::{SchemaChange, SchemaEngine, SchemaSubscriber};
pub use table::{
    message_columns, ColumnDef, MessageInfo, MessageSettings, TableDescriptor, COL_EPOCH, COL_ID,
    COL_PRIORITY, COL_TIME_ACKED, COL_TIME_NEXT, META_COLUMNS,
};
