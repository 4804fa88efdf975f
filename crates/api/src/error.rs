use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_core::error::{CapacityError, CoreError, PolicyError};
use kiln_pipeline::assets::AssetError;
use serde_json::{json, Map, Value};

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses
/// of the form `{"error": <message>, "code": <code>, ...extra}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `kiln_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An asset import or upload failed.
    #[error(transparent)]
    Asset(#[from] AssetError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An upload over its size ceiling.
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::InternalError(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut extra = Map::new();
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => classify_core_error(core, &mut extra),

            // --- Asset errors ---
            AppError::Asset(err) => classify_asset_error(err),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg.clone())
            }
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let mut body = Map::new();
        body.insert("error".into(), Value::String(message));
        body.insert("code".into(), Value::String(code.into()));
        body.extend(extra);

        (status, axum::Json(Value::Object(body))).into_response()
    }
}

/// Map a domain error onto a status, code and message.
///
/// Refusals that point the caller somewhere useful (the live job, the
/// remaining allowance) add their fields to `extra`.
fn classify_core_error(
    core: &CoreError,
    extra: &mut Map<String, Value>,
) -> (StatusCode, &'static str, String) {
    let code = core.code();
    match core {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            code,
            format!("{entity} with id {id} not found"),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, code, msg.clone()),
        CoreError::Policy(policy) => {
            let status = match policy {
                PolicyError::DailyLimit { used, limit } => {
                    extra.insert("daily_used".into(), json!(used));
                    extra.insert("daily_remaining".into(), json!(0));
                    extra.insert("daily_limit".into(), json!(limit));
                    StatusCode::TOO_MANY_REQUESTS
                }
                PolicyError::LimitReached { remaining, limit } => {
                    extra.insert("remaining".into(), json!(remaining));
                    extra.insert("limit".into(), json!(limit));
                    StatusCode::FORBIDDEN
                }
                PolicyError::ContentBlocked(category) | PolicyError::UpgradeRequired(category) => {
                    extra.insert("reason".into(), json!(category));
                    StatusCode::FORBIDDEN
                }
                PolicyError::LicenseRequired => StatusCode::FORBIDDEN,
            };
            (status, code, policy.to_string())
        }
        CoreError::Capacity(capacity) => {
            let status = match capacity {
                CapacityError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
                CapacityError::ConcurrentLimit { job_id } => {
                    extra.insert("job_id".into(), json!(job_id));
                    StatusCode::TOO_MANY_REQUESTS
                }
                CapacityError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            };
            (status, code, capacity.to_string())
        }
        CoreError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, code, msg.clone()),
        CoreError::Forbidden(msg) => (StatusCode::FORBIDDEN, code, msg.clone()),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal core error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                code,
                "An internal error occurred".to_string(),
            )
        }
    }
}

fn classify_asset_error(err: &AssetError) -> (StatusCode, &'static str, String) {
    match err {
        AssetError::BlockedHost(_) | AssetError::UnsupportedScheme => {
            (StatusCode::FORBIDDEN, "FORBIDDEN", err.to_string())
        }
        AssetError::TooLarge { .. } => {
            (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", err.to_string())
        }
        AssetError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        AssetError::HttpStatus(_) | AssetError::Request(_) => {
            (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", err.to_string())
        }
        _ if err.is_client_error() => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string()),
        _ => {
            tracing::error!(error = %err, "Asset error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            )
        }
    }
}
