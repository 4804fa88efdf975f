//! Route definitions for the `/assets` resource.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::handlers::assets;
use crate::state::AppState;

/// Routes mounted at `/assets`.
///
/// ```text
/// GET    /                    -> list
/// GET    /import/progress     -> import_progress
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(assets::list))
        .route("/import/progress", get(assets::import_progress))
}

/// Transfer routes mounted at `/assets`. These may run for minutes.
///
/// ```text
/// POST   /import              -> import (download by URL)
/// POST   /upload              -> upload (multipart, pro only)
/// ```
///
/// The upload handler enforces its own ceiling while streaming, so the
/// default body limit is lifted.
pub fn streaming_router() -> Router<AppState> {
    Router::new()
        .route("/import", post(assets::import))
        .route(
            "/upload",
            post(assets::upload).layer(DefaultBodyLimit::disable()),
        )
}
