// ============================
// crates/backend-lib/src/handlers/emit.rs
// ============================
//! Emit endpoint.
//!
//! `POST /realtime/emit` hands an event to the broker and answers as soon
//! as the fan-out has been queued. The response never says how many
//! connections received the event.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use metrics::counter;
use relay_common::EmitRequest;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::handlers::require_non_empty;
use crate::metrics::EMIT_REJECTED;
use crate::AppState;

/// Handler for `POST /realtime/emit`
pub async fn emit_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EmitRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let request = validate(body).inspect_err(|_| counter!(EMIT_REJECTED).increment(1))?;

    state
        .broker
        .publish(&request.room, &request.event, request.payload, request.user)?;

    Ok(Json(json!({ "ok": true })))
}

fn validate(body: Result<Json<EmitRequest>, JsonRejection>) -> Result<EmitRequest, AppError> {
    let Json(request) = body?;
    require_non_empty("room", &request.room)?;
    require_non_empty("event", &request.event)?;
    // the name becomes an SSE `event:` line
    if request.event.chars().any(char::is_control) {
        return Err(AppError::InvalidInput(
            "event must not contain control characters".to_string(),
        ));
    }
    Ok(request)
}
