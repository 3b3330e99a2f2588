// ============================
// relay-backend-lib/src/router.rs
// ============================
//! HTTP router of the relay server.
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{emit::emit_handler, health, stream::stream_handler};
use crate::middleware::rate_limit;
use crate::AppState;

/// Path of the streaming endpoint
pub const STREAM_PATH: &str = "/realtime/stream";
/// Path of the emit endpoint
pub const EMIT_PATH: &str = "/realtime/emit";

/// Create the relay router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = if state.settings.cors.allow_any_origin {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    let emit = Router::new()
        .route(EMIT_PATH, post(emit_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit));

    Router::new()
        .route(STREAM_PATH, get(stream_handler))
        .route("/healthz", get(health))
        .merge(emit)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
