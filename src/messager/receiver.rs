//! Message receivers and the per-table receiver multiplexer.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::QueryResult;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("receiver closed")]
    Closed,

    #[error("receiver buffer full")]
    Full,

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// A consumer of message batches.
///
/// The first result a receiver sees carries only field metadata; every later
/// result carries rows and no fields. A delivery error removes the receiver
/// from its table.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn deliver(&self, result: &QueryResult) -> Result<(), DeliveryError>;

    /// Called once when the receiver is removed.
    fn close(&self) {}
}

/// Receiver that forwards results into a bounded channel.
pub struct ChannelReceiver {
    sender: Mutex<Option<mpsc::Sender<QueryResult>>>,
}

impl ChannelReceiver {
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<QueryResult>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Arc::new(Self {
                sender: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }
}

#[async_trait]
impl Receiver for ChannelReceiver {
    async fn deliver(&self, result: &QueryResult) -> Result<(), DeliveryError> {
        let sender = self.sender.lock().clone().ok_or(DeliveryError::Closed)?;
        sender.try_send(result.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self) {
        self.sender.lock().take();
    }
}

/// Receiver backed by a plain callback.
pub struct FnReceiver<F> {
    f: F,
}

impl<F> FnReceiver<F>
where
    F: Fn(&QueryResult) -> Result<(), DeliveryError> + Send + Sync,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F> Receiver for FnReceiver<F>
where
    F: Fn(&QueryResult) -> Result<(), DeliveryError> + Send + Sync,
{
    async fn deliver(&self, result: &QueryResult) -> Result<(), DeliveryError> {
        (self.f)(result)
    }
}

struct Slot {
    id: u64,
    receiver: Arc<dyn Receiver>,
    busy: bool,
}

/// Set of receivers for one table, handed out round-robin.
///
/// A receiver is busy from the moment it is picked until its delivery
/// finishes; busy receivers are skipped.
#[derive(Default)]
pub struct ReceiverSet {
    slots: Vec<Slot>,
    cursor: usize,
    next_id: u64,
}

impl ReceiverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, receiver: Arc<dyn Receiver>) -> u64 {
        self.next_id += 1;
        self.slots.push(Slot {
            id: self.next_id,
            receiver,
            busy: false,
        });
        self.next_id
    }

    pub fn remove(&mut self, id: u64) -> Option<Arc<dyn Receiver>> {
        let idx = self.slots.iter().position(|s| s.id == id)?;
        let slot = self.slots.remove(idx);
        if idx < self.cursor {
            self.cursor -= 1;
        }
        Some(slot.receiver)
    }

    /// Pick the next idle receiver after the previous pick and mark it busy.
    pub fn next_idle(&mut self) -> Option<(u64, Arc<dyn Receiver>)> {
        let len = self.slots.len();
        for step in 0..len {
            let idx = (self.cursor + step) % len;
            let slot = &mut self.slots[idx];
            if !slot.busy {
                slot.busy = true;
                self.cursor = (idx + 1) % len;
                return Some((slot.id, slot.receiver.clone()));
            }
        }
        None
    }

    pub fn release(&mut self, id: u64) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) {
            slot.busy = false;
        }
    }

    pub fn has_idle(&self) -> bool {
        self.slots.iter().any(|s| !s.busy)
    }

    pub fn snapshot(&self) -> Vec<(u64, Arc<dyn Receiver>)> {
        self.slots
            .iter()
            .map(|s| (s.id, s.receiver.clone()))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Arc<dyn Receiver>> {
        self.cursor = 0;
        self.slots.drain(..).map(|s| s.receiver).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn noop() -> Arc<dyn Receiver> {
        FnReceiver::new(|_: &QueryResult| Ok(()))
    }

    #[test]
    fn test_round_robin_skips_busy() {
        let mut set = ReceiverSet::new();
        let a = set.add(noop());
        let b = set.add(noop());
        let c = set.add(noop());

        assert_eq!(set.next_idle().map(|(id, _)| id), Some(a));
        assert_eq!(set.next_idle().map(|(id, _)| id), Some(b));
        set.release(a);
        assert_eq!(set.next_idle().map(|(id, _)| id), Some(c));
        assert_eq!(set.next_idle().map(|(id, _)| id), Some(a));
        assert!(set.next_idle().is_none());
        assert!(!set.has_idle());

        set.release(b);
        assert_eq!(set.next_idle().map(|(id, _)| id), Some(b));
    }

    #[test]
    fn test_remove_keeps_rotation() {
        let mut set = ReceiverSet::new();
        let a = set.add(noop());
        let b = set.add(noop());
        let c = set.add(noop());

        assert_eq!(set.next_idle().map(|(id, _)| id), Some(a));
        set.release(a);
        assert!(set.remove(a).is_some());
        assert!(set.remove(a).is_none());
        assert_eq!(set.next_idle().map(|(id, _)| id), Some(b));
        assert_eq!(set.next_idle().map(|(id, _)| id), Some(c));
        assert_eq!(set.len(), 2);

        assert_eq!(set.drain().len(), 2);
        assert!(set.is_empty());
        assert!(set.next_idle().is_none());
    }

    #[tokio::test]
    async fn test_channel_receiver() {
        let (receiver, mut rx) = ChannelReceiver::new(1);
        let result = QueryResult {
            fields: vec![],
            rows: vec![vec![Value::text("1")]],
            rows_affected: 0,
        };

        receiver.deliver(&result).await.unwrap();
        assert!(matches!(
            receiver.deliver(&result).await,
            Err(DeliveryError::Full)
        ));
        assert_eq!(rx.recv().await.unwrap().rows, result.rows);

        receiver.close();
        assert!(receiver.is_closed());
        assert!(matches!(
            receiver.deliver(&result).await,
            Err(DeliveryError::Closed)
        ));
        assert!(rx.recv().await.is_none());
    }
}
