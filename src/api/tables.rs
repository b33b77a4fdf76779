//! Message table endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{MessagerError, Result};
use crate::messager::ManagerStats;
use crate::server::AppState;
use crate::types::Value;

#[derive(Debug, Serialize)]
pub struct TableListResponse {
    pub tables: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    /// Message ids; JSON numbers bind as integers, strings as text
    pub ids: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub table: String,
    pub acked: u64,
}

/// GET /api/v1/tables
pub async fn list_tables(State(state): State<AppState>) -> Json<TableListResponse> {
    Json(TableListResponse {
        tables: state.engine.manager_names(),
    })
}

/// GET /api/v1/tables/{table}
pub async fn get_table(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<ManagerStats>> {
    state
        .engine
        .manager(&table)
        .map(|manager| Json(manager.stats()))
        .ok_or_else(|| MessagerError::table_not_found(&table))
}

/// POST /api/v1/tables/{table}/ack
pub async fn ack_messages(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(request): Json<AckRequest>,
) -> Result<Json<AckResponse>> {
    let ids = request
        .ids
        .iter()
        .map(json_to_value)
        .collect::<Result<Vec<_>>>()?;
    let acked = state.engine.ack(&table, &ids).await?;
    Ok(Json(AckResponse { table, acked }))
}

fn json_to_value(value: &serde_json::Value) -> Result<Value> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int64)
            .or_else(|| n.as_u64().map(Value::UInt64))
            .ok_or_else(|| MessagerError::InvalidArgument(format!("id {} is not an integer", n))),
        serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
        other => Err(MessagerError::InvalidArgument(format!(
            "unsupported id {}",
            other
        ))),
    }
}
