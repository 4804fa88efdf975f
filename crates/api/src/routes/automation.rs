//! Route definitions for the `/v1` automation API.
//!
//! Every handler requires the `EXTERNAL_API_KEY` bearer.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::handlers::automation;
use crate::state::AppState;

/// Routes mounted at `/v1`.
///
/// ```text
/// POST   /generate            -> generate (202)
/// GET    /status/{id}         -> status
/// POST   /upload-reference    -> upload_reference (multipart)
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generate", post(automation::generate))
        .route("/status/{id}", get(automation::status))
        .route(
            "/upload-reference",
            post(automation::upload_reference).layer(DefaultBodyLimit::disable()),
        )
}
