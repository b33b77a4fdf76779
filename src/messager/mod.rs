//! Transactional message delivery over storage-backed message tables.
//!
//! The [`Engine`] keeps one [`MessageManager`] per message table, following
//! the schema feed. Managers cache due rows, hand them to subscribed
//! [`Receiver`]s and keep their retry state in storage through statements
//! built by the [`AckGenerator`].

mod backoff;
mod cache;
mod engine;
mod generator;
mod manager;
mod queue;
mod receiver;
mod row;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use cache::{CacheAdd, MessageCache};
pub use engine::Engine;
pub use generator::{AckGenerator, BoundQuery, MessageStatement};
pub use manager::{ManagerStats, MessageManager, Subscription};
pub use queue::PriorityQueue;
pub use receiver::{ChannelReceiver, DeliveryError, FnReceiver, Receiver, ReceiverSet};
pub use row::MessageRow;

use chrono::Utc;

/// Current time as unix nanoseconds, the unit of every message timestamp.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
