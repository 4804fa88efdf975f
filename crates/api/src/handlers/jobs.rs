//! Handlers for polling and cancelling individual jobs.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use kiln_core::queue::CancelOutcome;
use kiln_core::types::JobId;
use serde::Serialize;

use crate::error::AppResult;
use crate::handlers::SessionQuery;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/jobs/{id}/status
///
/// Unknown ids report `state: "unknown"` rather than 404 so pollers can
/// keep their loop simple.
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(DataResponse {
        data: state.scheduler.status(&job_id),
    }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub cancelled: bool,
    pub outcome: &'static str,
}

fn outcome_label(outcome: CancelOutcome) -> &'static str {
    match outcome {
        CancelOutcome::Removed => "removed",
        CancelOutcome::MarkedCancelled => "cancelled",
        CancelOutcome::AlreadyTerminal => "already_finished",
        CancelOutcome::NotFound => "not_found",
    }
}

/// POST /api/jobs/{id}/cancel?session_id=
///
/// Idempotent: cancelling a finished or unknown job succeeds with
/// `cancelled: false`. Another session's job is refused.
pub async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    Query(query): Query<SessionQuery>,
) -> AppResult<impl IntoResponse> {
    let session = query.require()?;
    let outcome = state.scheduler.cancel(&job_id, &session)?;

    Ok(Json(DataResponse {
        data: CancelResponse {
            job_id,
            cancelled: matches!(
                outcome,
                CancelOutcome::Removed | CancelOutcome::MarkedCancelled
            ),
            outcome: outcome_label(outcome),
        },
    }))
}
