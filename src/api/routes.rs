use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::health::{health, stats};
use super::metrics::prometheus_metrics;
use super::tables::{ack_messages, get_table, list_tables};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Message tables
        .nest(
            "/api/v1",
            Router::new()
                .route("/tables", get(list_tables))
                .route("/tables/{table}", get(get_table))
                .route("/tables/{table}/ack", post(ack_messages)),
        )
}
