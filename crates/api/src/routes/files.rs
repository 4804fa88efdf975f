//! Root-level routes serving stored images.

use axum::routing::get;
use axum::Router;

use crate::handlers::files;
use crate::state::AppState;

/// ```text
/// GET    /outputs/{sid}/{filename}?session_id=      -> output
/// GET    /references/{sid}/{filename}?session_id=   -> reference
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/outputs/{sid}/{filename}", get(files::output))
        .route("/references/{sid}/{filename}", get(files::reference))
}
