use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;

use crate::error::AppResult;
use crate::handlers::SessionQuery;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/history?session_id=
///
/// The session's recorded jobs, newest first.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> AppResult<impl IntoResponse> {
    let session = query.require()?;
    let entries = state.history.for_session(&session).await;
    Ok(Json(DataResponse { data: entries }))
}
