//! Schema-change feed.
//!
//! Keeps the live table map and fans schema changes out to registered
//! subscribers. Changes reach every subscriber in the order they were
//! applied: `apply` and the `run_now` replay hold the broadcast lock from the
//! table-map update (or snapshot) until the last subscriber returns.
//! The table map and notifier registry locks are released before any
//! subscriber runs, so a subscriber may unregister itself from its callback.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::table::TableDescriptor;

/// A batch of table changes plus the serving role at the time of the change.
#[derive(Debug, Clone, Default)]
pub struct SchemaChange {
    pub created: Vec<Arc<TableDescriptor>>,
    pub altered: Vec<Arc<TableDescriptor>>,
    pub dropped: Vec<Arc<TableDescriptor>>,
    pub is_primary: bool,
}

impl SchemaChange {
    pub fn created(tables: Vec<Arc<TableDescriptor>>, is_primary: bool) -> Self {
        Self {
            created: tables,
            is_primary,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.altered.is_empty() && self.dropped.is_empty()
    }
}

#[async_trait]
pub trait SchemaSubscriber: Send + Sync {
    async fn schema_changed(&self, change: &SchemaChange);
}

struct SchemaState {
    tables: BTreeMap<String, Arc<TableDescriptor>>,
    is_primary: bool,
}

/// Live schema plus its notifier registry.
pub struct SchemaEngine {
    state: RwLock<SchemaState>,
    notifiers: RwLock<HashMap<String, Arc<dyn SchemaSubscriber>>>,
    /// Serialises map updates together with their fan-out.
    broadcast_order: Mutex<()>,
}

impl SchemaEngine {
    pub fn new(is_primary: bool) -> Self {
        Self {
            state: RwLock::new(SchemaState {
                tables: BTreeMap::new(),
                is_primary,
            }),
            notifiers: RwLock::new(HashMap::new()),
            broadcast_order: Mutex::new(()),
        }
    }

    /// Register a subscriber under `name`, replacing any previous one.
    ///
    /// With `run_now`, the subscriber immediately receives the whole current
    /// schema as `created` tables.
    pub async fn register_notifier(
        &self,
        name: &str,
        subscriber: Arc<dyn SchemaSubscriber>,
        run_now: bool,
    ) {
        let _order = self.broadcast_order.lock().await;
        self.notifiers
            .write()
            .insert(name.to_string(), subscriber.clone());

        tracing::debug!(notifier = %name, run_now = run_now, "Schema notifier registered");

        if run_now {
            let change = {
                let state = self.state.read();
                SchemaChange::created(state.tables.values().cloned().collect(), state.is_primary)
            };
            subscriber.schema_changed(&change).await;
        }
    }

    pub fn unregister_notifier(&self, name: &str) {
        if self.notifiers.write().remove(name).is_some() {
            tracing::debug!(notifier = %name, "Schema notifier unregistered");
        }
    }

    /// Apply a change to the live table map and broadcast it.
    pub async fn apply(&self, change: SchemaChange) {
        let _order = self.broadcast_order.lock().await;
        {
            let mut state = self.state.write();
            state.is_primary = change.is_primary;
            for table in change.created.iter().chain(change.altered.iter()) {
                state.tables.insert(table.name.clone(), table.clone());
            }
            for table in &change.dropped {
                state.tables.remove(&table.name);
            }
        }
        self.broadcast(&change).await;
    }

    /// Broadcast without touching the live table map.
    pub async fn broadcast_for_testing(&self, change: SchemaChange) {
        let _order = self.broadcast_order.lock().await;
        self.broadcast(&change).await;
    }

    async fn broadcast(&self, change: &SchemaChange) {
        let subscribers: Vec<Arc<dyn SchemaSubscriber>> =
            self.notifiers.read().values().cloned().collect();

        for subscriber in subscribers {
            subscriber.schema_changed(change).await;
        }
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableDescriptor>> {
        self.state.read().tables.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state.read().tables.keys().cloned().collect()
    }

    pub fn is_primary(&self) -> bool {
        self.state.read().is_primary
    }

    pub fn notifier_count(&self) -> usize {
        self.notifiers.read().len()
    }
}

impl Default for SchemaEngine {
    fn default() -> Self {
        Self::new(true)
    }
}
