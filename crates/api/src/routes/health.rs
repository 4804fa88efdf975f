use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the engine answered `/system_stats`.
    pub engine_healthy: bool,
    pub queued_jobs: usize,
    pub running_jobs: usize,
}

/// GET /health -- returns service and engine health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine_healthy = match state.engine.system_stats().await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Engine health check failed");
            false
        }
    };
    let (queued_jobs, running_jobs) = state.scheduler.load();

    let status = if engine_healthy { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        engine_healthy,
        queued_jobs,
        running_jobs,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
