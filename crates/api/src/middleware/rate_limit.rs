//! Fixed-window request ceiling per client address.
//!
//! Mounted on the `/api` tree with `axum::middleware::from_fn_with_state`.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use kiln_core::error::{CapacityError, CoreError};

use crate::error::AppError;
use crate::middleware::client_ip::ClientIp;
use crate::state::AppState;

pub async fn rate_limit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    request: Request,
    next: Next,
) -> Response {
    if !state.rate_limiter.check(&ip, Utc::now().timestamp_millis()) {
        tracing::debug!(client_ip = %ip, path = %request.uri().path(), "Rate limit exceeded");
        return AppError::Core(CoreError::Capacity(CapacityError::RateLimited)).into_response();
    }
    next.run(request).await
}
