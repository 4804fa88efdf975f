//! License key activation.

use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use kiln_core::error::CoreError;
use kiln_core::license::Plan;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Delay before answering a failed activation, to slow down key guessing.
const FAILED_ACTIVATION_DELAY: Duration = Duration::from_millis(500);

/// Claim recorded in metered tokens so they can be told apart in logs.
const LIMITED_KEY_CLAIM: &str = "limited";

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    pub token: String,
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// POST /api/license/activate
///
/// Exchanges an activation key for a signed token. The master key mints an
/// unlimited pro token; the limited key mints a metered one whose meter
/// starts full.
pub async fn activate(
    State(state): State<AppState>,
    Json(input): Json<ActivateRequest>,
) -> AppResult<impl IntoResponse> {
    let key = normalize_key(&input.key);
    let config = &state.config;
    let now = Utc::now();

    if !key.is_empty() && key == normalize_key(&config.master_pro_key) {
        let token = state.signer.issue(Plan::Pro, None, None, now);
        tracing::info!("Pro license activated");
        return Ok(Json(DataResponse {
            data: ActivateResponse {
                token,
                plan: Plan::Pro,
                limit: None,
            },
        }));
    }

    if !key.is_empty() && key == normalize_key(&config.limited_pro_key) {
        let limit = config.limited_pro_limit;
        let token = state
            .signer
            .issue(Plan::Pro, Some(limit), Some(LIMITED_KEY_CLAIM.into()), now);
        state.meter.prime(&token, limit);
        tracing::info!(limit, "Limited pro license activated");
        return Ok(Json(DataResponse {
            data: ActivateResponse {
                token,
                plan: Plan::Pro,
                limit: Some(limit),
            },
        }));
    }

    tracing::warn!(key_len = key.len(), "License activation failed");
    tokio::time::sleep(FAILED_ACTIVATION_DELAY).await;
    Err(CoreError::Unauthorized("Invalid license key".into()).into())
}
