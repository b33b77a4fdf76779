//! Message engine: keeps one [`MessageManager`] per message table.
//!
//! # Locking
//!
//! - `lifecycle` serialises `open` and `close`; `schema_changed` never takes it.
//! - `state` guards the registry and is never held across an await. Managers
//!   that go away are removed under the lock and closed after it is released.
//! - The schema feed invokes subscribers holding only its broadcast-order
//!   lock, which `close` never needs.
//!
//! Together these let `close` race any number of schema broadcasts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::config::MessagerConfig;
use crate::error::{MessagerError, Result};
use crate::metrics::{EngineMetrics, MessagerMetrics};
use crate::schema::{SchemaChange, SchemaEngine, SchemaSubscriber, TableDescriptor};
use crate::storage::QueryExecutor;
use crate::types::Value;

use super::generator::AckGenerator;
use super::manager::{ManagerStats, MessageManager, Subscription};
use super::now_nanos;
use super::receiver::Receiver;
use super::row::MessageRow;

/// Name under which the engine registers with the schema feed.
const NOTIFIER_NAME: &str = "messages";

struct EngineState {
    is_open: bool,
    is_primary: bool,
    managers: HashMap<String, Arc<MessageManager>>,
}

pub struct Engine {
    schema: Arc<SchemaEngine>,
    executor: Arc<dyn QueryExecutor>,
    config: MessagerConfig,
    lifecycle: Mutex<()>,
    state: RwLock<EngineState>,
}

impl Engine {
    pub fn new(
        schema: Arc<SchemaEngine>,
        executor: Arc<dyn QueryExecutor>,
        config: MessagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            schema,
            executor,
            config,
            lifecycle: Mutex::new(()),
            state: RwLock::new(EngineState {
                is_open: false,
                is_primary: false,
                managers: HashMap::new(),
            }),
        })
    }

    /// Start following the schema feed. The registry is rebuilt from the
    /// current schema before this returns. No-op if already open.
    #[tracing::instrument(name = "messager.open", skip_all)]
    pub async fn open(self: &Arc<Self>) {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.state.write();
            if state.is_open {
                return;
            }
            state.is_open = true;
        }

        let subscriber: Arc<dyn SchemaSubscriber> = self.clone();
        self.schema
            .register_notifier(NOTIFIER_NAME, subscriber, true)
            .await;

        tracing::info!(
            managers = self.state.read().managers.len(),
            backend = self.executor.backend_type(),
            "Message engine opened"
        );
    }

    /// Stop following the schema feed and shut every manager down.
    /// No-op if already closed.
    #[tracing::instrument(name = "messager.close", skip_all)]
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let managers: Vec<Arc<MessageManager>> = {
            let mut state = self.state.write();
            if !state.is_open {
                return;
            }
            state.is_open = false;
            state.managers.drain().map(|(_, manager)| manager).collect()
        };
        self.schema.unregister_notifier(NOTIFIER_NAME);

        join_all(managers.iter().map(|manager| manager.close())).await;
        EngineMetrics::set_managers_active(0);

        tracing::info!(managers = managers.len(), "Message engine closed");
    }

    /// Reconcile the registry with a batch of schema changes.
    ///
    /// Ignored while closed. Tables that already have a manager built from an
    /// identical descriptor are left alone; anything else that is a valid
    /// message table gets a fresh manager. Tables that were dropped or are no
    /// longer message tables lose their manager.
    #[tracing::instrument(
        name = "messager.schema_changed",
        skip_all,
        fields(
            created = created.len(),
            altered = altered.len(),
            dropped = dropped.len(),
            is_primary = is_primary
        )
    )]
    pub async fn schema_changed(
        &self,
        created: &[Arc<TableDescriptor>],
        altered: &[Arc<TableDescriptor>],
        dropped: &[Arc<TableDescriptor>],
        is_primary: bool,
    ) {
        let retired = {
            let mut state = self.state.write();
            if !state.is_open {
                return;
            }
            state.is_primary = is_primary;
            for manager in state.managers.values() {
                manager.set_primary(is_primary);
            }

            let mut retired = Vec::new();
            for table in dropped {
                if let Some(manager) = state.managers.remove(&table.name) {
                    tracing::info!(table = %table.name, "Message table dropped");
                    retired.push(manager);
                }
            }

            for table in created.iter().chain(altered) {
                if !table.is_message_table() {
                    if let Some(manager) = state.managers.remove(&table.name) {
                        tracing::info!(table = %table.name, "Table is no longer a message table");
                        retired.push(manager);
                    }
                    continue;
                }
                let unchanged = state
                    .managers
                    .get(&table.name)
                    .is_some_and(|m| m.descriptor().as_ref() == table.as_ref());
                if unchanged {
                    continue;
                }

                match MessageManager::new(table.clone(), self.executor.clone(), &self.config) {
                    Ok(manager) => {
                        manager.open(is_primary);
                        if let Some(old) = state.managers.insert(table.name.clone(), manager) {
                            retired.push(old);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            table = %table.name,
                            error = %e,
                            "Skipping invalid message table"
                        );
                        if let Some(old) = state.managers.remove(&table.name) {
                            retired.push(old);
                        }
                    }
                }
            }

            EngineMetrics::set_managers_active(state.managers.len());
            retired
        };

        join_all(retired.iter().map(|manager| manager.close())).await;
    }

    /// Attach a receiver to a message table.
    ///
    /// Fails with `Unavailable` while the engine is closed and `NotFound` if
    /// the table has no manager. Dropping the returned [`Subscription`]
    /// detaches the receiver.
    #[tracing::instrument(name = "messager.subscribe", skip(self, receiver))]
    pub async fn subscribe(
        &self,
        table: &str,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Subscription> {
        let manager = {
            let state = self.state.read();
            if !state.is_open {
                return Err(MessagerError::Unavailable(
                    "messager engine is closed, probably because this is not a primary any more"
                        .to_string(),
                ));
            }
            state.managers.get(table).cloned()
        };
        let manager = manager.ok_or_else(|| MessagerError::table_not_found(table))?;
        manager.subscribe(receiver).await
    }

    pub fn get_generator(&self, table: &str) -> Result<AckGenerator> {
        self.state
            .read()
            .managers
            .get(table)
            .map(|manager| manager.generator().clone())
            .ok_or_else(|| {
                MessagerError::NotFound(format!("message table {} not found in schema", table))
            })
    }

    /// Offer a freshly written row to its table's cache.
    pub fn add(&self, table: &str, row: MessageRow) -> bool {
        self.manager(table)
            .map(|manager| manager.add(row))
            .unwrap_or(false)
    }

    /// Acknowledge messages. Returns the number of rows acked in storage.
    #[tracing::instrument(name = "messager.ack", skip(self, ids), fields(count = ids.len()))]
    pub async fn ack(&self, table: &str, ids: &[Value]) -> Result<u64> {
        let manager = self
            .manager(table)
            .ok_or_else(|| MessagerError::table_not_found(table))?;
        let query = manager.generator().generate_ack(ids, now_nanos())?;
        let result = self.executor.execute_fetch(&query, 0, false).await?;

        manager.discard(ids);
        MessagerMetrics::record_acked(table, result.rows_affected);
        tracing::debug!(table = %table, acked = result.rows_affected, "Messages acked");

        Ok(result.rows_affected)
    }

    pub fn manager(&self, table: &str) -> Option<Arc<MessageManager>> {
        self.state.read().managers.get(table).cloned()
    }

    /// Sorted names of the managed tables.
    pub fn manager_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().managers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_open(&self) -> bool {
        self.state.read().is_open
    }

    pub fn is_primary(&self) -> bool {
        self.state.read().is_primary
    }

    pub fn stats(&self) -> Vec<ManagerStats> {
        let managers: Vec<Arc<MessageManager>> =
            self.state.read().managers.values().cloned().collect();
        let mut stats: Vec<ManagerStats> = managers.iter().map(|m| m.stats()).collect();
        stats.sort_by(|a, b| a.table.cmp(&b.table));
        stats
    }
}

#[async_trait]
impl SchemaSubscriber for Engine {
    async fn schema_changed(&self, change: &SchemaChange) {
        Engine::schema_changed(
            self,
            &change.created,
            &change.altered,
            &change.dropped,
            change.is_primary,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{message_columns, ColumnDef, MessageSettings};
    use crate::storage::MemoryMessageStore;
    use crate::types::FieldType;

    fn engine() -> Arc<Engine> {
        Engine::new(
            Arc::new(SchemaEngine::new(true)),
            Arc::new(MemoryMessageStore::new()),
            MessagerConfig::default(),
        )
    }

    fn message_table(name: &str) -> Arc<TableDescriptor> {
        Arc::new(TableDescriptor::message(
            name,
            message_columns(&["message"]),
            MessageSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_schema_changed_ignored_while_closed() {
        let engine = engine();
        engine
            .schema_changed(&[message_table("t1")], &[], &[], true)
            .await;
        assert!(engine.manager_names().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_message_table_is_skipped() {
        let engine = engine();
        engine.open().await;

        let broken = Arc::new(TableDescriptor::message(
            "broken",
            vec![ColumnDef::new("id", FieldType::Int64)],
            MessageSettings::default(),
        ));
        engine
            .schema_changed(&[broken, message_table("t1")], &[], &[], true)
            .await;
        assert_eq!(engine.manager_names(), vec!["t1"]);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_identical_descriptor_keeps_manager() {
        let engine = engine();
        engine.open().await;

        engine
            .schema_changed(&[message_table("t1")], &[], &[], true)
            .await;
        let first = engine.manager("t1").unwrap();

        engine
            .schema_changed(&[message_table("t1")], &[], &[], true)
            .await;
        assert!(Arc::ptr_eq(&first, &engine.manager("t1").unwrap()));

        let altered = Arc::new(TableDescriptor::message(
            "t1",
            message_columns(&["message", "extra"]),
            MessageSettings::default(),
        ));
        engine.schema_changed(&[], &[altered], &[], true).await;
        let rebuilt = engine.manager("t1").unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert!(first.is_closed());

        engine.close().await;
    }

    #[tokio::test]
    async fn test_primary_flag_reaches_managers() {
        let engine = engine();
        engine.open().await;

        engine
            .schema_changed(&[message_table("t1")], &[], &[], false)
            .await;
        let manager = engine.manager("t1").unwrap();
        assert!(!manager.is_primary());
        assert!(!engine.add("t1", MessageRow::new(vec![Value::text("1")])));

        engine.schema_changed(&[], &[], &[], true).await;
        assert!(manager.is_primary());
        assert!(engine.is_primary());

        engine.close().await;
    }

    #[tokio::test]
    async fn test_ack_requires_ids() {
        let engine = engine();
        engine.open().await;
        engine
            .schema_changed(&[message_table("t1")], &[], &[], true)
            .await;

        let err = engine.ack("t1", &[]).await.unwrap_err();
        assert!(matches!(err, MessagerError::InvalidArgument(_)));

        let err = engine.ack("missing", &[Value::text("1")]).await.unwrap_err();
        assert_eq!(err.to_string(), "message table missing not found");

        engine.close().await;
    }
}
