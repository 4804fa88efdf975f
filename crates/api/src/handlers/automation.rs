//! The `/api/v1` automation API.
//!
//! All calls run as the reserved automation session with a privileged
//! tier: no daily allowance, no paid-content gate. The always-blocked
//! vocabulary and the one-live-job-per-session rule still apply.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use kiln_core::error::CoreError;
use kiln_core::generation::GenerationRequest;
use kiln_core::queue::{Artifact, JobStatus};
use kiln_core::scheduling::JobState;
use kiln_core::session::{sanitize_filename, SessionId};
use kiln_core::types::JobId;
use serde::Serialize;

use crate::error::AppResult;
use crate::handlers::generation::preflight;
use crate::handlers::references::{
    image_extension, reference_url, store_reference, OnClash, MAX_REFERENCE_BYTES,
};
use crate::middleware::automation::ExternalAgent;
use crate::middleware::client_ip::ClientIp;
use crate::middleware::license::LicenseTier;
use crate::response::DataResponse;
use crate::state::AppState;
use crate::upload;

/// Prefix that marks automation job ids in logs and history.
pub const AUTOMATION_JOB_PREFIX: &str = "ext_";

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub job_id: JobId,
    pub message: &'static str,
}

/// POST /api/v1/generate
///
/// Answers `202 Accepted`; poll `/api/v1/status/{id}` for the result.
pub async fn generate(
    _agent: ExternalAgent,
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Json(request): Json<GenerationRequest>,
) -> AppResult<impl IntoResponse> {
    let session = SessionId::automation();
    preflight(&state, &session, &request, true).await?;

    let job_id = format!("{AUTOMATION_JOB_PREFIX}{}", uuid::Uuid::new_v4());
    let admission = state.scheduler.submit(
        job_id,
        session,
        &client_ip,
        &LicenseTier::automation(),
        request,
    )?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: AcceptedResponse {
                job_id: admission.job_id,
                message: "Job accepted and queued",
            },
        }),
    ))
}

/// A job reaped from the live queue, as recorded in history.
#[derive(Debug, Serialize)]
pub struct ArchivedStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub results: Vec<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum AutomationStatus {
    Live(JobStatus),
    Archived(ArchivedStatus),
}

/// GET /api/v1/status/{id}
///
/// Live jobs first, then the history log. 404 when neither knows the id.
pub async fn status(
    _agent: ExternalAgent,
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let live = state.scheduler.status(&job_id);
    if live.state != JobState::Unknown {
        return Ok(Json(DataResponse {
            data: AutomationStatus::Live(live),
        }));
    }

    let entry = state
        .history
        .find(&job_id)
        .await
        .ok_or_else(|| CoreError::NotFound {
            entity: "Job",
            id: job_id.clone(),
        })?;
    Ok(Json(DataResponse {
        data: AutomationStatus::Archived(ArchivedStatus {
            job_id: entry.job_id,
            state: entry.state,
            results: entry.results,
            image_url: entry.image_url,
            error: entry.error,
        }),
    }))
}

#[derive(Debug, Serialize)]
pub struct ReferenceUploaded {
    pub filename: String,
    pub url: String,
}

/// POST /api/v1/upload-reference (multipart: `file`)
///
/// Unlike the browser upload, a clashing name is stored under a new
/// suffixed name, and a non-image extension is refused outright.
pub async fn upload_reference(
    _agent: ExternalAgent,
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
    let file = form.require_file()?;
    let name = sanitize_filename(&file.original_name);
    if image_extension(&name).is_none() {
        return Err(CoreError::Validation("Invalid file type".into()).into());
    }

    let session = SessionId::automation();
    let filename = store_reference(&state, &session, file, name, OnClash::Rename).await?;
    Ok(Json(DataResponse {
        data: ReferenceUploaded {
            url: reference_url(&session, &filename),
            filename,
        },
    }))
}
