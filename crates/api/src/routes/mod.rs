pub mod assets;
pub mod automation;
pub mod files;
pub mod health;
pub mod jobs;
pub mod references;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the request/response part of the `/api` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /generate                                   submit generation (POST)
/// /status?session_id=                         queue + daily allowance snapshot
/// /history?session_id=                        session history
/// /license/activate                           exchange key for token (POST)
///
/// /jobs/{id}/status                           job status
/// /jobs/{id}/cancel?session_id=               cancel (POST)
///
/// /assets?session_id=                         shared + session assets
/// /assets/import/progress?session_id=         import progress poll
///
/// /references?session_id=                     list, upload (GET, POST)
/// /references/{filename}?session_id=          delete (DELETE)
///
/// /v1/generate                                automation submit (POST)
/// /v1/status/{id}                             automation status
/// /v1/upload-reference                        automation reference upload (POST)
/// ```
///
/// Everything here is subject to the request timeout. Long-lived routes
/// live in [`streaming_routes`].
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/generate", post(handlers::generation::generate))
        .route("/status", get(handlers::generation::status))
        .route("/history", get(handlers::history::list))
        .route("/license/activate", post(handlers::license::activate))
        .nest("/jobs", jobs::router())
        .nest("/assets", assets::router())
        .nest("/references", references::router())
        .nest("/v1", automation::router())
}

/// The `/api` routes exempt from the request timeout.
///
/// ```text
/// /jobs/{id}/events?session_id=               WebSocket event stream
/// /assets/import                              download by URL (POST)
/// /assets/upload                              multipart upload (POST)
/// ```
pub fn streaming_routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::streaming_router())
        .nest("/assets", assets::streaming_router())
}
