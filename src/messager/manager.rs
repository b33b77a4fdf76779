//! Per-table message manager.
//!
//! Each message table gets one manager running three background tasks:
//!
//! - **poller**: loads due rows from storage into the cache and expires rows
//!   that ran out of delivery attempts
//! - **sender**: hands cached rows to idle receivers, then leases them by
//!   rescheduling them in storage with backoff
//! - **purger**: deletes acknowledged rows once they are old enough
//!
//! Storage stays the source of truth. A message is gone only once it has been
//! acked (or expired) in storage; everything held here can be rebuilt by the
//! next poll.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};

use crate::config::MessagerConfig;
use crate::error::{MessagerError, Result};
use crate::metrics::MessagerMetrics;
use crate::schema::{MessageInfo, TableDescriptor};
use crate::storage::{QueryExecutor, StorageError};
use crate::types::{QueryResult, Value};

use super::backoff::{BackoffPolicy, ExponentialBackoff};
use super::cache::{CacheAdd, MessageCache};
use super::generator::AckGenerator;
use super::now_nanos;
use super::receiver::{Receiver, ReceiverSet};
use super::row::MessageRow;

/// Point-in-time view of a manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub table: String,
    /// Rows waiting for a receiver
    pub cached: usize,
    /// Rows handed out and not yet released
    pub in_flight: usize,
    pub receivers: usize,
    pub is_primary: bool,
}

struct ManagerState {
    cache: MessageCache,
    receivers: ReceiverSet,
    /// Ids discarded while a load is running; `None` between loads
    discarded_during_load: Option<HashSet<String>>,
    opened: bool,
    closed: bool,
}

/// Rows picked for one receiver.
struct Dispatch {
    receiver_id: u64,
    receiver: Arc<dyn Receiver>,
    rows: Vec<MessageRow>,
}

/// State shared between the manager handle and its background tasks.
pub(crate) struct ManagerShared {
    info: Arc<MessageInfo>,
    generator: AckGenerator,
    executor: Arc<dyn QueryExecutor>,
    backoff: BackoffPolicy,
    purge_interval: Duration,
    purge_batch_size: usize,
    delivery_timeout: Duration,
    state: Mutex<ManagerState>,
    /// Wakes the sender when rows or receivers become available
    wake: Notify,
    shutdown: broadcast::Sender<()>,
    is_primary: AtomicBool,
}

/// Manages delivery for one message table.
pub struct MessageManager {
    descriptor: Arc<TableDescriptor>,
    shared: Arc<ManagerShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageManager {
    /// Fails with `InvalidArgument` if the table layout is not a valid
    /// message table.
    pub fn new(
        descriptor: Arc<TableDescriptor>,
        executor: Arc<dyn QueryExecutor>,
        config: &MessagerConfig,
    ) -> Result<Arc<Self>> {
        let info = Arc::new(MessageInfo::resolve(&descriptor, config)?);
        let backoff = BackoffPolicy::for_table(info.min_backoff, info.max_backoff, config);
        let (shutdown, _) = broadcast::channel(1);

        let shared = Arc::new(ManagerShared {
            generator: AckGenerator::from_info(info.clone()),
            state: Mutex::new(ManagerState {
                cache: MessageCache::new(info.cache_size),
                receivers: ReceiverSet::new(),
                discarded_during_load: None,
                opened: false,
                closed: false,
            }),
            info,
            executor,
            backoff,
            purge_interval: config.purge_interval(),
            purge_batch_size: config.purge_batch_size.max(1),
            delivery_timeout: config.delivery_timeout(),
            wake: Notify::new(),
            shutdown,
            is_primary: AtomicBool::new(false),
        });

        Ok(Arc::new(Self {
            descriptor,
            shared,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start the poller, sender and purger. A manager is opened at most once.
    pub fn open(&self, is_primary: bool) {
        {
            let mut state = self.shared.state.lock();
            if state.opened || state.closed {
                return;
            }
            state.opened = true;
        }
        self.shared.is_primary.store(is_primary, Ordering::SeqCst);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(run_poller(
            self.shared.clone(),
            self.shared.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(run_sender(
            self.shared.clone(),
            self.shared.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(run_purger(
            self.shared.clone(),
            self.shared.shutdown.subscribe(),
        )));

        tracing::info!(
            table = %self.shared.info.table,
            is_primary = is_primary,
            cache_size = self.shared.info.cache_size,
            batch_size = self.shared.info.batch_size,
            "Message manager opened"
        );
    }

    /// Stop all background work. Receivers are closed, in-flight deliveries
    /// are allowed to finish (bounded by the delivery timeout), and the cache
    /// is dropped.
    pub async fn close(&self) {
        let receivers = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.receivers.drain()
        };
        for receiver in &receivers {
            receiver.close();
        }

        let _ = self.shared.shutdown.send(());
        self.shared.wake.notify_one();

        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(table = %self.shared.info.table, error = %e, "Message manager task failed");
            }
        }

        self.shared.state.lock().cache.clear();
        MessagerMetrics::clear_table(&self.shared.info.table);

        tracing::info!(
            table = %self.shared.info.table,
            receivers = receivers.len(),
            "Message manager closed"
        );
    }

    /// Register a receiver. It first gets the field metadata, then batches.
    pub async fn subscribe(&self, receiver: Arc<dyn Receiver>) -> Result<Subscription> {
        let table = self.shared.info.table.clone();
        let fields = QueryResult::fields_only(self.shared.info.fields.clone());
        match timeout(self.shared.delivery_timeout, receiver.deliver(&fields)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                receiver.close();
                return Err(MessagerError::Unavailable(format!(
                    "receiver for {} rejected field metadata: {}",
                    table, e
                )));
            }
            Err(_) => {
                receiver.close();
                return Err(MessagerError::Unavailable(format!(
                    "receiver for {} timed out on field metadata",
                    table
                )));
            }
        }

        let registered = {
            let mut state = self.shared.state.lock();
            if state.closed {
                None
            } else {
                let id = state.receivers.add(receiver.clone());
                MessagerMetrics::set_receivers(&table, state.receivers.len());
                Some(id)
            }
        };
        let Some(id) = registered else {
            receiver.close();
            return Err(MessagerError::table_not_found(&table));
        };

        self.shared.wake.notify_one();
        tracing::debug!(table = %table, receiver_id = id, "Receiver subscribed");

        Ok(Subscription {
            table,
            id,
            manager: Arc::downgrade(&self.shared),
            active: AtomicBool::new(true),
        })
    }

    /// Fast path for a freshly written row. Returns false if the row was not
    /// taken; the poller will pick it up later (and expire it if it has used
    /// up its delivery attempts).
    pub fn add(&self, row: MessageRow) -> bool {
        if !self.is_primary() || row.time_next > now_nanos() {
            return false;
        }
        if self.shared.is_exhausted(&row) {
            return false;
        }
        let added = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return false;
            }
            let outcome = state.cache.add(row);
            MessagerMetrics::set_cache_size(&self.shared.info.table, state.cache.len());
            outcome == CacheAdd::Added
        };
        if added {
            self.shared.wake.notify_one();
        }
        added
    }

    /// Drop ids from the cache, pending or in flight.
    pub fn discard(&self, ids: &[Value]) -> usize {
        let keys: Vec<String> = ids.iter().map(Value::to_key).collect();
        let mut state = self.shared.state.lock();
        if let Some(discarded) = state.discarded_during_load.as_mut() {
            discarded.extend(keys.iter().cloned());
        }
        let removed = state.cache.discard(keys.iter().map(String::as_str));
        MessagerMetrics::set_cache_size(&self.shared.info.table, state.cache.len());
        removed
    }

    /// Deliver `result` to every receiver regardless of the rotation.
    /// Receivers that fail are removed.
    pub async fn broadcast(&self, result: &QueryResult) -> usize {
        let receivers = self.shared.state.lock().receivers.snapshot();
        let mut delivered = 0;
        for (id, receiver) in receivers {
            match timeout(self.shared.delivery_timeout, receiver.deliver(result)).await {
                Ok(Ok(())) => delivered += 1,
                _ => self.shared.disconnect(id),
            }
        }
        delivered
    }

    pub fn set_primary(&self, is_primary: bool) {
        let was = self.shared.is_primary.swap(is_primary, Ordering::SeqCst);
        if was != is_primary {
            tracing::info!(table = %self.shared.info.table, is_primary = is_primary, "Message manager role changed");
            if is_primary {
                self.shared.wake.notify_one();
            }
        }
    }

    pub fn is_primary(&self) -> bool {
        self.shared.is_primary()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn table(&self) -> &str {
        &self.shared.info.table
    }

    pub fn descriptor(&self) -> &Arc<TableDescriptor> {
        &self.descriptor
    }

    pub fn info(&self) -> &Arc<MessageInfo> {
        &self.shared.info
    }

    pub fn generator(&self) -> &AckGenerator {
        &self.shared.generator
    }

    pub fn stats(&self) -> ManagerStats {
        let state = self.shared.state.lock();
        ManagerStats {
            table: self.shared.info.table.clone(),
            cached: state.cache.len(),
            in_flight: state.cache.in_flight_len(),
            receivers: state.receivers.len(),
            is_primary: self.is_primary(),
        }
    }
}

impl Drop for MessageManager {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(());
    }
}

/// Handle for a registered receiver. Dropping it unsubscribes.
pub struct Subscription {
    table: String,
    id: u64,
    manager: Weak<ManagerShared>,
    active: AtomicBool,
}

impl Subscription {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.manager.strong_count() > 0
    }

    /// Remove the receiver from its table and close it.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            if let Some(receiver) = manager.remove_receiver(self.id) {
                receiver.close();
                tracing::debug!(table = %self.table, receiver_id = self.id, "Receiver unsubscribed");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl ManagerShared {
    fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// True once a row has used up its delivery attempts.
    fn is_exhausted(&self, row: &MessageRow) -> bool {
        self.info.max_epoch > 0 && row.epoch >= self.info.max_epoch
    }

    fn remove_receiver(&self, id: u64) -> Option<Arc<dyn Receiver>> {
        let mut state = self.state.lock();
        let receiver = state.receivers.remove(id);
        MessagerMetrics::set_receivers(&self.info.table, state.receivers.len());
        receiver
    }

    fn disconnect(&self, id: u64) {
        if let Some(receiver) = self.remove_receiver(id) {
            receiver.close();
            MessagerMetrics::record_receiver_disconnect(&self.info.table);
            tracing::debug!(table = %self.info.table, receiver_id = id, "Receiver removed after failed delivery");
        }
    }

    /// Pick the next idle receiver and up to `batch_size` rows for it.
    fn next_dispatch(&self) -> Option<Dispatch> {
        if !self.is_primary() {
            return None;
        }
        let mut state = self.state.lock();
        if state.closed || state.cache.is_empty() {
            return None;
        }
        let (receiver_id, receiver) = state.receivers.next_idle()?;

        let mut rows = Vec::with_capacity(self.info.batch_size);
        while rows.len() < self.info.batch_size {
            match state.cache.pop() {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        MessagerMetrics::set_cache_size(&self.info.table, state.cache.len());

        Some(Dispatch {
            receiver_id,
            receiver,
            rows,
        })
    }

    async fn deliver(self: Arc<Self>, job: Dispatch) {
        let result = QueryResult {
            rows: job.rows.iter().map(|r| r.row.clone()).collect(),
            ..Default::default()
        };

        let start = Instant::now();
        let outcome = timeout(self.delivery_timeout, job.receiver.deliver(&result)).await;
        match outcome {
            Ok(Ok(())) => {
                MessagerMetrics::record_delivered(&self.info.table, job.rows.len() as u64);
                MessagerMetrics::record_delivery_latency(&self.info.table, start.elapsed());
                self.state.lock().receivers.release(job.receiver_id);
            }
            Ok(Err(e)) => {
                tracing::debug!(table = %self.info.table, error = %e, "Delivery failed");
                self.disconnect(job.receiver_id);
            }
            Err(_) => {
                tracing::debug!(
                    table = %self.info.table,
                    timeout_ms = self.delivery_timeout.as_millis() as u64,
                    "Delivery timed out"
                );
                self.disconnect(job.receiver_id);
            }
        }

        // Leased until the backoff elapses or an ack lands, whichever first.
        self.postpone(&job.rows).await;

        let keys: Vec<String> = job.rows.iter().map(MessageRow::key).collect();
        self.state.lock().cache.discard(keys.iter().map(String::as_str));
        self.wake.notify_one();
    }

    async fn postpone(&self, rows: &[MessageRow]) {
        let now = now_nanos();
        let mut by_epoch: BTreeMap<i64, Vec<Value>> = BTreeMap::new();
        for row in rows {
            if let Some(id) = row.id().filter(|id| !id.is_null()) {
                by_epoch.entry(row.epoch).or_default().push(id.clone());
            }
        }

        for (epoch, ids) in by_epoch {
            let time_next = now.saturating_add(nanos(self.backoff.delay(epoch)));
            let query = match self.generator.generate_reschedule(&ids, time_next) {
                Ok(query) => query,
                Err(e) => {
                    tracing::warn!(table = %self.info.table, error = %e, "Failed to build reschedule");
                    continue;
                }
            };
            match self.executor.execute_fetch(&query, 0, false).await {
                Ok(result) => {
                    MessagerMetrics::record_postponed(&self.info.table, result.rows_affected)
                }
                Err(e) => tracing::warn!(
                    table = %self.info.table,
                    count = ids.len(),
                    error = %e,
                    "Failed to reschedule messages"
                ),
            }
        }
    }

    /// Load due rows into the cache. Returns the number of rows added.
    async fn poll(&self) -> std::result::Result<usize, StorageError> {
        let room = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(0);
            }
            let room = state.cache.capacity().saturating_sub(state.cache.len());
            if room == 0 {
                return Ok(0);
            }
            state.discarded_during_load = Some(HashSet::new());
            room
        };

        let query = self.generator.generate_load(now_nanos(), room);
        let result = self.executor.execute_fetch(&query, room, false).await;

        let mut loaded = 0;
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock();
            let discarded = state.discarded_during_load.take().unwrap_or_default();
            let result = result?;
            if state.closed {
                return Ok(0);
            }
            for values in result.rows {
                let row = match MessageRow::from_load_row(values) {
                    Ok(row) => row,
                    Err(e) => {
                        tracing::warn!(table = %self.info.table, error = %e, "Skipping malformed message row");
                        continue;
                    }
                };
                if discarded.contains(&row.key()) {
                    continue;
                }
                if self.is_exhausted(&row) {
                    expired.push(row);
                    continue;
                }
                match state.cache.add(row) {
                    CacheAdd::Added => loaded += 1,
                    CacheAdd::Duplicate => {}
                    CacheAdd::Full => break,
                }
            }
            MessagerMetrics::set_cache_size(&self.info.table, state.cache.len());
        }

        if loaded > 0 {
            tracing::trace!(table = %self.info.table, count = loaded, "Loaded messages");
            self.wake.notify_one();
        }
        if !expired.is_empty() {
            self.expire(&expired).await?;
        }
        Ok(loaded)
    }

    async fn expire(&self, rows: &[MessageRow]) -> std::result::Result<(), StorageError> {
        let ids: Vec<Value> = rows
            .iter()
            .filter_map(|r| r.id().filter(|id| !id.is_null()).cloned())
            .collect();
        let query = match self.generator.generate_expire(&ids, now_nanos()) {
            Ok(query) => query,
            Err(_) => return Ok(()),
        };
        let result = self.executor.execute_fetch(&query, 0, false).await?;

        for row in rows {
            let err = MessagerError::Expired {
                id: row.key(),
                max_epoch: self.info.max_epoch,
            };
            tracing::warn!(table = %self.info.table, epoch = row.epoch, error = %err, "Message expired");
        }
        MessagerMetrics::record_expired(&self.info.table, result.rows_affected);
        Ok(())
    }

    /// Delete acked rows older than `purge_after`, one chunk at a time.
    async fn purge(&self) -> std::result::Result<u64, StorageError> {
        let cutoff = now_nanos().saturating_sub(nanos(self.info.purge_after));
        let mut total = 0;
        loop {
            let query = self.generator.generate_purge(cutoff, self.purge_batch_size);
            let purged = self.executor.execute_fetch(&query, 0, false).await?.rows_affected;
            total += purged;
            if (purged as usize) < self.purge_batch_size {
                break;
            }
        }
        if total > 0 {
            MessagerMetrics::record_purged(&self.info.table, total);
            tracing::debug!(table = %self.info.table, count = total, "Purged acked messages");
        }
        Ok(total)
    }
}

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

async fn run_poller(shared: Arc<ManagerShared>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(shared.info.poller_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry = ExponentialBackoff::for_poller(shared.info.poller_interval);
    let mut retry_in: Option<Duration> = None;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = async {
                match retry_in {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        ticker.tick().await;
                    }
                }
            } => {}
        }
        if !shared.is_primary() {
            retry_in = None;
            continue;
        }

        match shared.poll().await {
            Ok(_) => {
                retry.reset();
                retry_in = None;
            }
            Err(e) => {
                MessagerMetrics::record_poll_error(&shared.info.table);
                let delay = retry.next_delay();
                tracing::warn!(
                    table = %shared.info.table,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Message poll failed"
                );
                retry_in = Some(delay);
            }
        }
    }

    tracing::debug!(table = %shared.info.table, "Poller stopped");
}

async fn run_sender(shared: Arc<ManagerShared>, mut shutdown: broadcast::Receiver<()>) {
    let mut deliveries = JoinSet::new();

    loop {
        while let Some(finished) = deliveries.try_join_next() {
            if let Err(e) = finished {
                tracing::warn!(table = %shared.info.table, error = %e, "Delivery task failed");
            }
        }

        if let Some(job) = shared.next_dispatch() {
            deliveries.spawn(shared.clone().deliver(job));
            continue;
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = shared.wake.notified() => {}
            Some(finished) = deliveries.join_next(), if !deliveries.is_empty() => {
                if let Err(e) = finished {
                    tracing::warn!(table = %shared.info.table, error = %e, "Delivery task failed");
                }
            }
        }
    }

    // Outstanding deliveries are bounded by the delivery timeout.
    while let Some(finished) = deliveries.join_next().await {
        if let Err(e) = finished {
            tracing::warn!(table = %shared.info.table, error = %e, "Delivery task failed");
        }
    }

    tracing::debug!(table = %shared.info.table, "Sender stopped");
}

async fn run_purger(shared: Arc<ManagerShared>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(shared.purge_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }
        if !shared.is_primary() {
            continue;
        }
        if let Err(e) = shared.purge().await {
            tracing::warn!(table = %shared.info.table, error = %e, "Message purge failed");
        }
    }

    tracing::debug!(table = %shared.info.table, "Purger stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messager::{BoundQuery, ChannelReceiver, DeliveryError, FnReceiver, MessageStatement};
    use crate::schema::{message_columns, MessageSettings};
    use crate::storage::{MemoryMessageStore, StoredMessage};
    use async_trait::async_trait;

    /// Holds every load result until released.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryMessageStore,
        loaded: Notify,
        release: Notify,
    }

    #[async_trait]
    impl QueryExecutor for GatedStore {
        async fn execute_fetch(
            &self,
            query: &BoundQuery,
            max_rows: usize,
            want_fields: bool,
        ) -> std::result::Result<QueryResult, StorageError> {
            let result = self.inner.execute_fetch(query, max_rows, want_fields).await;
            if matches!(query.statement, MessageStatement::Load { .. }) {
                self.loaded.notify_one();
                self.release.notified().await;
            }
            result
        }

        fn backend_type(&self) -> &'static str {
            "gated"
        }
    }

    fn descriptor(name: &str) -> Arc<TableDescriptor> {
        Arc::new(TableDescriptor::message(
            name,
            message_columns(&["message"]),
            MessageSettings::default(),
        ))
    }

    fn config() -> MessagerConfig {
        MessagerConfig {
            poller_interval_ms: 3_600_000,
            ack_wait_ms: 60_000,
            cache_size: 2,
            ..Default::default()
        }
    }

    fn row(id: &str) -> MessageRow {
        MessageRow::new(vec![Value::text(id), Value::text("payload")])
    }

    #[test]
    fn test_new_rejects_plain_tables() {
        let store = Arc::new(MemoryMessageStore::new());
        let plain = Arc::new(TableDescriptor::standard("plain", message_columns(&[])));
        let err = MessageManager::new(plain, store, &config()).err().unwrap();
        assert!(matches!(err, MessagerError::InvalidArgument(_)));
    }

    #[test]
    fn test_add_fast_path_rules() {
        let store = Arc::new(MemoryMessageStore::new());
        let manager = MessageManager::new(descriptor("t1"), store, &config()).unwrap();

        // not primary yet
        assert!(!manager.add(row("1")));

        manager.set_primary(true);
        assert!(manager.add(row("1")));
        assert!(!manager.add(row("1")));

        let future = MessageRow {
            time_next: now_nanos() + 60_000_000_000,
            ..row("later")
        };
        assert!(!manager.add(future));

        assert!(manager.add(row("2")));
        assert!(!manager.add(row("3")));
        assert_eq!(manager.stats().cached, 2);

        assert_eq!(manager.discard(&[Value::text("1")]), 1);
        assert_eq!(manager.stats().cached, 1);
    }

    #[test]
    fn test_add_rejects_exhausted_rows() {
        let store = Arc::new(MemoryMessageStore::new());
        let config = MessagerConfig {
            max_epoch: 3,
            ..config()
        };
        let manager = MessageManager::new(descriptor("t1"), store, &config).unwrap();
        manager.set_primary(true);

        let exhausted = MessageRow {
            epoch: 3,
            ..row("1")
        };
        assert!(!manager.add(exhausted));
        assert!(manager.add(MessageRow { epoch: 2, ..row("2") }));
        assert_eq!(manager.stats().cached, 1);
    }

    #[tokio::test]
    async fn test_rows_discarded_during_load_are_not_cached() {
        let store = Arc::new(GatedStore::default());
        store.inner.insert("t1", StoredMessage::new("1", vec![Value::text("payload")]));
        store.inner.insert("t1", StoredMessage::new("2", vec![Value::text("payload")]));
        let manager = MessageManager::new(descriptor("t1"), store.clone(), &config()).unwrap();
        manager.open(true);

        tokio::time::timeout(Duration::from_secs(5), store.loaded.notified())
            .await
            .unwrap();
        manager.discard(&[Value::text("1")]);
        store.release.notify_one();

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.stats().cached == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.stats().cached, 1);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_subscribe_sends_fields_then_rows() {
        let store = Arc::new(MemoryMessageStore::new());
        let manager = MessageManager::new(descriptor("t1"), store.clone(), &config()).unwrap();
        manager.open(true);

        let (receiver, mut rx) = ChannelReceiver::new(10);
        let subscription = manager.subscribe(receiver).await.unwrap();
        assert_eq!(subscription.table(), "t1");

        let fields = rx.recv().await.unwrap();
        assert_eq!(fields.fields.len(), 2);
        assert!(fields.rows.is_empty());

        store.insert("t1", StoredMessage::new("1", vec![Value::text("payload")]));
        assert!(manager.add(row("1")));

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.rows, vec![vec![Value::text("1"), Value::text("payload")]]);
        assert!(batch.fields.is_empty());

        // leased: rescheduled in storage with the epoch bumped
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get("t1", "1").map(|m| m.epoch) != Some(1) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.close().await;
        assert!(manager.is_closed());
        assert_eq!(manager.stats().receivers, 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_removes_receiver() {
        let store = Arc::new(MemoryMessageStore::new());
        let manager = MessageManager::new(descriptor("t1"), store, &config()).unwrap();
        manager.open(true);

        let receiver = FnReceiver::new(|result: &QueryResult| {
            if result.rows.is_empty() {
                Ok(())
            } else {
                Err(DeliveryError::Failed("boom".to_string()))
            }
        });
        let _subscription = manager.subscribe(receiver).await.unwrap();
        assert_eq!(manager.stats().receivers, 1);

        manager.add(row("1"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.stats().receivers != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.close().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let store = Arc::new(MemoryMessageStore::new());
        let manager = MessageManager::new(descriptor("t1"), store, &config()).unwrap();
        manager.open(true);

        let (receiver, _rx) = ChannelReceiver::new(10);
        let subscription = manager.subscribe(receiver.clone()).await.unwrap();
        assert_eq!(manager.stats().receivers, 1);

        drop(subscription);
        assert_eq!(manager.stats().receivers, 0);
        assert!(receiver.is_closed());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_subscribe_after_close_fails() {
        let store = Arc::new(MemoryMessageStore::new());
        let manager = MessageManager::new(descriptor("t1"), store, &config()).unwrap();
        manager.open(true);
        manager.close().await;

        let (receiver, _rx) = ChannelReceiver::new(10);
        let err = manager.subscribe(receiver.clone()).await.err().unwrap();
        assert_eq!(err.to_string(), "message table t1 not found");
        assert!(receiver.is_closed());
        assert!(!manager.add(row("1")));
    }
}
