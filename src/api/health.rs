//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::messager::ManagerStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub engine: EngineHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct EngineHealthResponse {
    pub open: bool,
    pub is_primary: bool,
    pub managers: usize,
    pub schema_tables: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub is_primary: bool,
    pub tables: Vec<ManagerStats>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let open = state.engine.is_open();
    let status = if open { "healthy" } else { "closed" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        engine: EngineHealthResponse {
            open,
            is_primary: state.engine.is_primary(),
            managers: state.engine.manager_names().len(),
            schema_tables: state.schema.table_names().len(),
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        is_primary: state.engine.is_primary(),
        tables: state.engine.stats(),
    })
}
