//! Route definitions for the `/jobs` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;
use crate::ws;

/// Routes mounted at `/jobs`.
///
/// ```text
/// GET    /{id}/status     -> get_status
/// POST   /{id}/cancel     -> cancel
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/status", get(jobs::get_status))
        .route("/{id}/cancel", post(jobs::cancel))
}

/// Long-lived routes mounted at `/jobs`.
///
/// ```text
/// GET    /{id}/events     -> WebSocket event stream
/// ```
pub fn streaming_router() -> Router<AppState> {
    Router::new().route("/{id}/events", get(ws::job_events))
}
