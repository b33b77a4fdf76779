//! Prometheus metrics for the messager.
//!
//! - Delivery metrics (delivered, postponed, acked, expired, purged per table)
//! - Manager metrics (cached rows, receivers, active managers)
//! - Error metrics (poll failures, receiver disconnects)

mod helpers;

pub use helpers::{encode_metrics, EngineMetrics, MessagerMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "messager";

lazy_static! {
    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Messages handed to a receiver
    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total messages successfully handed to a receiver",
        &["table"]
    ).unwrap();

    /// Messages acknowledged
    pub static ref MESSAGES_ACKED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_acked_total", METRIC_PREFIX),
        "Total messages acknowledged",
        &["table"]
    ).unwrap();

    /// Messages rescheduled with backoff after a delivery attempt
    pub static ref MESSAGES_POSTPONED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_postponed_total", METRIC_PREFIX),
        "Total messages rescheduled after a delivery attempt",
        &["table"]
    ).unwrap();

    /// Messages given up on after reaching the epoch limit
    pub static ref MESSAGES_EXPIRED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_expired_total", METRIC_PREFIX),
        "Total messages expired after too many delivery attempts",
        &["table"]
    ).unwrap();

    /// Acked rows deleted by the purger
    pub static ref MESSAGES_PURGED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_purged_total", METRIC_PREFIX),
        "Total acknowledged messages purged from storage",
        &["table"]
    ).unwrap();

    /// Delivery latency per batch
    pub static ref DELIVERY_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_delivery_latency_seconds", METRIC_PREFIX),
        "Time spent handing one batch to a receiver",
        &["table"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // ============================================================================
    // Error Metrics
    // ============================================================================

    /// Failed poller runs
    pub static ref POLL_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_poll_errors_total", METRIC_PREFIX),
        "Total poller runs that failed against storage",
        &["table"]
    ).unwrap();

    /// Receivers removed after a failed delivery
    pub static ref RECEIVER_DISCONNECTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_receiver_disconnects_total", METRIC_PREFIX),
        "Total receivers removed after a failed or timed out delivery",
        &["table"]
    ).unwrap();

    // ============================================================================
    // Manager Metrics
    // ============================================================================

    /// Rows waiting in a manager's cache
    pub static ref CACHE_SIZE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_cache_size", METRIC_PREFIX),
        "Number of messages waiting in the cache",
        &["table"]
    ).unwrap();

    /// Subscribed receivers
    pub static ref RECEIVERS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_receivers", METRIC_PREFIX),
        "Number of receivers subscribed to a table",
        &["table"]
    ).unwrap();

    /// Live message managers
    pub static ref MANAGERS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_managers_active", METRIC_PREFIX),
        "Number of message tables with a running manager"
    ).unwrap();
}
