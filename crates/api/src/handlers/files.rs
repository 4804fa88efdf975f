//! Serving stored images back to the session that owns them.
//!
//! Both routes carry the session twice: in the path, and as the
//! `?session_id=` query the browser holds. They must agree.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use kiln_core::error::CoreError;
use kiln_core::session::SessionId;

use crate::error::AppResult;
use crate::handlers::SessionQuery;
use crate::state::AppState;

fn content_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// The path session, provided the query names the same one.
fn owning_session(path_sid: &str, query: &SessionQuery) -> AppResult<SessionId> {
    if query.session_id.as_deref() != Some(path_sid) {
        return Err(CoreError::Forbidden("Session mismatch".into()).into());
    }
    SessionId::parse(path_sid)
        .map_err(|_| CoreError::Forbidden("Session mismatch".into()).into())
}

async fn send_file(path: PathBuf, filename: &str) -> AppResult<impl IntoResponse> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((
            [
                (header::CONTENT_TYPE, content_type(filename)),
                (header::CACHE_CONTROL, "private, max-age=3600"),
            ],
            bytes,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoreError::NotFound {
            entity: "File",
            id: filename.to_string(),
        }
        .into()),
        Err(e) => Err(e.into()),
    }
}

/// GET /outputs/{sid}/{filename}?session_id=
pub async fn output(
    State(state): State<AppState>,
    Path((sid, filename)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
) -> AppResult<impl IntoResponse> {
    let session = owning_session(&sid, &query)?;
    let path = state.store.output_path(&session, &filename)?;
    send_file(path, &filename).await
}

/// GET /references/{sid}/{filename}?session_id=
pub async fn reference(
    State(state): State<AppState>,
    Path((sid, filename)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
) -> AppResult<impl IntoResponse> {
    let session = owning_session(&sid, &query)?;
    let path = state.store.reference_path(&session, &filename).await?;
    send_file(path, &filename).await
}
