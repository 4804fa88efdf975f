//! Handlers for weight assets: listing, URL import and file upload.

use axum::extract::{Multipart, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use kiln_core::error::{CoreError, PolicyError};
use kiln_core::session::{sanitize_filename, SessionId};
use kiln_pipeline::assets::download::MAX_ASSET_BYTES;
use kiln_pipeline::assets::has_asset_extension;
use kiln_pipeline::assets::progress::{ImportProgress, FINISHED_TTL};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::handlers::{require_session, SessionQuery};
use crate::middleware::license::LicenseTier;
use crate::response::DataResponse;
use crate::state::AppState;
use crate::upload;

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// GET /api/assets?session_id=
///
/// Shared assets, plus the session's own when a valid `session_id` is given.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> AppResult<impl IntoResponse> {
    let session = query
        .session_id
        .as_deref()
        .map(SessionId::parse)
        .transpose()?;
    let names = state.resolver.list_available(session.as_ref()).await?;
    Ok(Json(DataResponse { data: names }))
}

// ---------------------------------------------------------------------------
// Import by URL
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub session_id: Option<String>,
    pub url: String,
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub filename: String,
    pub bytes: u64,
    /// The file was already present; nothing was fetched.
    pub deduplicated: bool,
}

/// POST /api/assets/import
///
/// Downloads into the session's asset folder. The request stays open for
/// the whole transfer; poll `/api/assets/import/progress` meanwhile.
pub async fn import(
    State(state): State<AppState>,
    Json(input): Json<ImportRequest>,
) -> AppResult<impl IntoResponse> {
    let session = require_session(input.session_id.as_deref())?;
    let asset = state
        .resolver
        .import_url(&session, &input.url, input.filename.as_deref())
        .await?;

    tracing::info!(
        session_id = %session,
        asset = %asset.filename,
        bytes = asset.bytes,
        deduplicated = asset.deduplicated,
        "Asset imported"
    );
    Ok(Json(DataResponse {
        data: ImportResponse {
            filename: asset.filename,
            bytes: asset.bytes,
            deduplicated: asset.deduplicated,
        },
    }))
}

/// GET /api/assets/import/progress?session_id=
pub async fn import_progress(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> AppResult<impl IntoResponse> {
    let session = query.require()?;
    Ok(Json(DataResponse {
        data: state.resolver.progress().get(&session),
    }))
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub filename: String,
}

/// POST /api/assets/upload (multipart: `session_id`, `file`)
///
/// Pro and automation callers only. Uploading a name that already exists
/// in the session folder succeeds without replacing it.
pub async fn upload(
    State(state): State<AppState>,
    tier: LicenseTier,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    if !tier.is_pro() {
        return Err(CoreError::from(PolicyError::LicenseRequired).into());
    }

    let progress = state.resolver.progress();
    let on_progress = |sid: Option<&str>, bytes: u64| {
        if let Some(session) = sid.and_then(|s| SessionId::parse(s).ok()) {
            progress.update(&session, ImportProgress::uploading(bytes, 0));
        }
    };
    let mut form = upload::receive(
        &mut multipart,
        &state.config.uploads_tmp_dir(),
        MAX_ASSET_BYTES,
        &on_progress,
    )
    .await?;

    let session = require_session(form.session_id.as_deref())?;
    let file = form.require_file()?;
    let name = sanitize_filename(&file.original_name);
    if !has_asset_extension(&name) {
        progress.finish(
            &session,
            ImportProgress::failed("Unsupported file type"),
            FINISHED_TTL,
        );
        return Err(CoreError::Validation(
            "Invalid file type. Allowed: .safetensors, .bin, .pt, .ckpt".into(),
        )
        .into());
    }

    let dest = state.store.assets_dir(&session).await?.join(&name);
    let bytes = file.bytes;
    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        tracing::info!(session_id = %session, asset = %name, "Asset already present, upload discarded");
    } else {
        file.persist(&dest).await?;
        tracing::info!(session_id = %session, asset = %name, bytes, "Asset uploaded");
    }
    progress.finish(&session, ImportProgress::done(bytes), FINISHED_TTL);

    Ok(Json(DataResponse {
        data: UploadResponse { filename: name },
    }))
}
