//! Route definitions for the `/references` resource.

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get};
use axum::Router;

use crate::handlers::references;
use crate::state::AppState;

/// Routes mounted at `/references`.
///
/// ```text
/// GET    /?session_id=            -> list
/// POST   /                        -> upload (multipart)
/// DELETE /{filename}?session_id=  -> delete
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(references::list)
                .post(references::upload)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/{filename}", delete(references::delete))
}
