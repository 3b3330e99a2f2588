// ============================
// crates/backend-lib/src/handlers/mod.rs
// ============================
//! HTTP handlers of the realtime endpoints.

pub mod emit;
pub mod stream;

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /healthz`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "rooms": state.registry.room_count(),
        "connections": state.registry.total_connections(),
    }))
}

/// Shared validation of room/user/event identifiers
pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), crate::error::AppError> {
    if value.trim().is_empty() {
        return Err(crate::error::AppError::InvalidInput(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}
