//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    CACHE_SIZE, DELIVERY_LATENCY, MANAGERS_ACTIVE, MESSAGES_ACKED_TOTAL, MESSAGES_DELIVERED_TOTAL,
    MESSAGES_EXPIRED_TOTAL, MESSAGES_POSTPONED_TOTAL, MESSAGES_PURGED_TOTAL, POLL_ERRORS_TOTAL,
    RECEIVERS, RECEIVER_DISCONNECTS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Per-table recording helpers used by the message managers.
pub struct MessagerMetrics;

impl MessagerMetrics {
    pub fn record_delivered(table: &str, count: u64) {
        MESSAGES_DELIVERED_TOTAL
            .with_label_values(&[table])
            .inc_by(count);
    }

    pub fn record_delivery_latency(table: &str, elapsed: Duration) {
        DELIVERY_LATENCY
            .with_label_values(&[table])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_acked(table: &str, count: u64) {
        MESSAGES_ACKED_TOTAL.with_label_values(&[table]).inc_by(count);
    }

    pub fn record_postponed(table: &str, count: u64) {
        MESSAGES_POSTPONED_TOTAL
            .with_label_values(&[table])
            .inc_by(count);
    }

    pub fn record_expired(table: &str, count: u64) {
        MESSAGES_EXPIRED_TOTAL
            .with_label_values(&[table])
            .inc_by(count);
    }

    pub fn record_purged(table: &str, count: u64) {
        MESSAGES_PURGED_TOTAL.with_label_values(&[table]).inc_by(count);
    }

    pub fn record_poll_error(table: &str) {
        POLL_ERRORS_TOTAL.with_label_values(&[table]).inc();
    }

    pub fn record_receiver_disconnect(table: &str) {
        RECEIVER_DISCONNECTS_TOTAL.with_label_values(&[table]).inc();
    }

    pub fn set_cache_size(table: &str, size: usize) {
        CACHE_SIZE.with_label_values(&[table]).set(size as i64);
    }

    pub fn set_receivers(table: &str, count: usize) {
        RECEIVERS.with_label_values(&[table]).set(count as i64);
    }

    /// Zero out the gauges of a manager that is going away.
    pub fn clear_table(table: &str) {
        Self::set_cache_size(table, 0);
        Self::set_receivers(table, 0);
    }
}

/// Helper struct for engine-level metrics
pub struct EngineMetrics;

impl EngineMetrics {
    pub fn set_managers_active(count: usize) {
        MANAGERS_ACTIVE.set(count as i64);
    }
}
