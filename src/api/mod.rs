//! Admin API: health, stats, metrics and per-table endpoints.

mod health;
mod metrics;
mod routes;
mod tables;

pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
pub use tables::{ack_messages, get_table, list_tables};
