//! Handlers for generation submission and the per-session status poll.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use kiln_core::error::CoreError;
use kiln_core::generation::GenerationRequest;
use kiln_core::session::SessionId;
use kiln_core::types::{new_job_id, JobId};
use serde::{Deserialize, Serialize};

use crate::engine::QueueSnapshot;
use crate::error::AppResult;
use crate::handlers::{require_session, SessionQuery};
use crate::middleware::client_ip::ClientIp;
use crate::middleware::license::LicenseTier;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Shared checks
// ---------------------------------------------------------------------------

/// Everything that can be decided about a request before it is queued.
///
/// Content screening comes first so a blocked prompt is reported as such
/// even when other fields are also wrong.
pub(crate) async fn preflight(
    state: &AppState,
    session: &SessionId,
    request: &GenerationRequest,
    privileged: bool,
) -> AppResult<()> {
    let negative = request.negative.as_deref().unwrap_or_default();
    if let Err(e) = state
        .content_policy
        .screen(&[&request.prompt, negative], privileged)
    {
        tracing::warn!(session_id = %session, reason = %e, "Generation refused by content policy");
        return Err(CoreError::from(e).into());
    }

    request.validate()?;

    for name in &request.reference_images {
        let path = state.store.reference_path(session, name).await?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(CoreError::Validation(format!("Reference image not found: {name}")).into());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub request: GenerationRequest,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pro_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pro_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u32>,
}

/// POST /api/generate
///
/// Queue a generation for the calling session. A session that already has
/// a live job gets `CONCURRENT_LIMIT` with that job's id.
pub async fn generate(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    tier: LicenseTier,
    Json(body): Json<GenerateBody>,
) -> AppResult<impl IntoResponse> {
    let session = require_session(body.session_id.as_deref())?;
    preflight(&state, &session, &body.request, tier.is_pro()).await?;

    let admission = state.scheduler.submit(
        new_job_id(),
        session,
        &client_ip,
        &tier,
        body.request,
    )?;

    Ok(Json(DataResponse {
        data: GenerateResponse {
            job_id: admission.job_id,
            pro_remaining: admission.meter.map(|m| m.remaining),
            pro_limit: admission.meter.map(|m| m.limit),
            daily_remaining: admission.daily.map(|d| d.remaining),
            daily_limit: admission.daily.map(|d| d.limit),
        },
    }))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(flatten)]
    pub queue: QueueSnapshot,
    pub daily_used: u32,
    pub daily_remaining: u32,
    pub daily_limit: u32,
}

/// GET /api/status?session_id=
///
/// Queue length, the session's place in it, and the caller's remaining
/// free allowance for today.
pub async fn status(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Query(query): Query<SessionQuery>,
) -> AppResult<impl IntoResponse> {
    let session = query.require()?;
    let daily = state.daily.check(&client_ip, Utc::now().date_naive());

    Ok(Json(DataResponse {
        data: StatusResponse {
            connected: true,
            queue: state.scheduler.snapshot(&session),
            daily_used: daily.used,
            daily_remaining: daily.remaining,
            daily_limit: daily.limit,
        },
    }))
}
