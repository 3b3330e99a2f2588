// ============================
// crates/backend-lib/src/handlers/stream.rs
// ============================
//! Streaming endpoint.
//!
//! `GET /realtime/stream?room=..&id=..&name=..&role=..` holds the response
//! open and writes one named SSE frame per broker push. The connection is
//! registered before the first byte goes out and unregistered when axum
//! drops the body, which covers client aborts, write errors and shutdown.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use relay_common::{kinds, StreamParams};

use crate::error::AppError;
use crate::handlers::require_non_empty;
use crate::AppState;

/// Handler for `GET /realtime/stream`
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<StreamParams>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let Query(params) = params?;
    require_non_empty("room", &params.room)?;
    require_non_empty("id", &params.id)?;

    let subscription = state.broker.connect(&params.room, params.user())?;
    let frames = subscription
        .map(|frame| Ok::<_, Infallible>(Event::default().event(&*frame.event).data(&*frame.data)));

    let keep_alive = KeepAlive::new()
        .interval(state.settings.stream.heartbeat())
        .event(Event::default().event(kinds::PING).data("{}"));

    Ok(Sse::new(frames).keep_alive(keep_alive))
}
