//! Bearer authentication for the `/api/v1` automation API.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use kiln_core::error::CoreError;

use crate::error::AppError;
use crate::middleware::license::bearer_token;
use crate::state::AppState;

/// Proof that the request carried the configured automation API key.
///
/// ```ignore
/// async fn handler(_agent: ExternalAgent, State(state): State<AppState>) { .. }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ExternalAgent;

impl FromRequestParts<AppState> for ExternalAgent {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match bearer_token(parts) {
            Some(token) if token == state.config.external_api_key => Ok(ExternalAgent),
            presented => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    has_credential = presented.is_some(),
                    "Rejected automation API request",
                );
                Err(AppError::Core(CoreError::Unauthorized(
                    "Invalid or missing API key".into(),
                )))
            }
        }
    }
}
