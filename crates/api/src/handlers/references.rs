//! Reference image management, scoped to one session.
//!
//! Reference images are stored under `<sessions>/<sid>/references/` and fed
//! to the generation graph by name.

use std::path::Path;

use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use kiln_core::error::CoreError;
use kiln_core::generation::MAX_REFERENCE_IMAGES;
use kiln_core::session::{sanitize_filename, SessionId, MAX_FILENAME_LEN};
use serde::Serialize;

use crate::error::AppResult;
use crate::handlers::{require_session, SessionQuery};
use crate::response::DataResponse;
use crate::state::AppState;
use crate::upload::{self, TempUpload};

/// Largest accepted reference image.
pub const MAX_REFERENCE_BYTES: u64 = 10 * 1024 * 1024;

/// Anything smaller cannot be a real image.
pub const MIN_REFERENCE_BYTES: u64 = 1024;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

const FALLBACK_EXTENSION: &str = ".png";

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

pub(crate) fn image_extension(name: &str) -> Option<&str> {
    let (_, ext) = name.rsplit_once('.')?;
    IMAGE_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
        .then_some(ext)
}

/// Storable name for an uploaded reference image.
///
/// Names that sanitize to nothing get a timestamped `ref_` name. A missing
/// or unknown extension becomes `.png`.
pub(crate) fn reference_name(original: &str) -> String {
    let base = original.rsplit(['/', '\\']).next().unwrap_or_default();
    let name = if base.chars().all(|c| c == '.') {
        format!("ref_{}", Utc::now().timestamp_millis())
    } else {
        sanitize_filename(base)
    };
    if image_extension(&name).is_some() {
        return name;
    }
    let mut stem = name;
    stem.truncate(MAX_FILENAME_LEN - FALLBACK_EXTENSION.len());
    stem + FALLBACK_EXTENSION
}

/// `<stem>_<millis>.<ext>`, for uploads that must not replace a file.
pub(crate) fn unique_name(name: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_{millis}.{ext}"),
        None => format!("{name}_{millis}"),
    }
}

pub fn reference_url(session: &SessionId, filename: &str) -> String {
    format!("/references/{session}/{filename}?session_id={session}")
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// What to do when the target name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnClash {
    /// Keep the stored file and report success under its name.
    KeepExisting,
    /// Store the upload under a timestamp-suffixed name.
    Rename,
}

async fn image_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if image_extension(name).is_some() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Move an uploaded image into the session's reference folder.
///
/// Returns the name it is stored under.
pub(crate) async fn store_reference(
    state: &AppState,
    session: &SessionId,
    file: TempUpload,
    name: String,
    on_clash: OnClash,
) -> AppResult<String> {
    let dir = state.store.references_dir(session).await?;
    if image_files(&dir).await?.len() >= MAX_REFERENCE_IMAGES {
        return Err(CoreError::Validation(format!(
            "Maximum {MAX_REFERENCE_IMAGES} reference images allowed"
        ))
        .into());
    }
    if file.bytes < MIN_REFERENCE_BYTES {
        return Err(
            CoreError::Validation("File is too small to be a valid image".into()).into(),
        );
    }

    let mut name = name;
    if tokio::fs::try_exists(dir.join(&name)).await.unwrap_or(false) {
        match on_clash {
            OnClash::KeepExisting => {
                tracing::info!(session_id = %session, reference = %name, "Reference already present, upload discarded");
                return Ok(name);
            }
            OnClash::Rename => name = unique_name(&name),
        }
    }

    file.persist(&dir.join(&name)).await?;
    tracing::info!(session_id = %session, reference = %name, "Reference image stored");
    Ok(name)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ReferenceEntry {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub url: String,
}

/// GET /api/references?session_id=
///
/// No session means nothing to list.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> AppResult<impl IntoResponse> {
    let Some(raw) = query.session_id.as_deref() else {
        return Ok(Json(DataResponse {
            data: Vec::<ReferenceEntry>::new(),
        }));
    };
    let session = SessionId::parse(raw)?;
    let dir = state.store.references_dir(&session).await?;
    let entries = image_files(&dir)
        .await?
        .into_iter()
        .map(|name| ReferenceEntry {
            url: reference_url(&session, &name),
            name,
        })
        .collect();
    Ok(Json(DataResponse { data: entries }))
}

/// POST /api/references (multipart: `session_id`, `file`)
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let mut form = upload::receive(
        &mut multipart,
        &state.config.uploads_tmp_dir(),
        MAX_REFERENCE_BYTES,
        &|_, _| {},
    )
    .await?;
    let session = require_session(form.session_id.as_deref())?;
    let file = form.require_file()?;
    let name = reference_name(&file.original_name);

    let filename = store_reference(&state, &session, file, name, OnClash::KeepExisting).await?;
    Ok(Json(DataResponse {
        data: UploadResponse {
            url: reference_url(&session, &filename),
            filename,
        },
    }))
}

/// DELETE /api/references/{filename}?session_id=
pub async fn delete(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
    Query(query): Query<SessionQuery>,
) -> AppResult<impl IntoResponse> {
    let session = query.require()?;
    let path = state.store.reference_path(&session, &filename).await?;
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            tracing::info!(session_id = %session, reference = %filename, "Reference image deleted");
            Ok(Json(DataResponse {
                data: serde_json::json!({ "deleted": filename }),
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoreError::NotFound {
            entity: "Reference image",
            id: filename,
        }
        .into()),
        Err(e) => Err(e.into()),
    }
}
