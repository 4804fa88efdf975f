//! HTTP request handlers, grouped by resource.

pub mod assets;
pub mod automation;
pub mod files;
pub mod generation;
pub mod history;
pub mod jobs;
pub mod license;
pub mod references;

use kiln_core::error::CoreError;
use kiln_core::session::SessionId;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// `?session_id=` query parameter.
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

impl SessionQuery {
    /// The validated session. A missing id is rejected like a malformed one.
    pub fn require(&self) -> AppResult<SessionId> {
        require_session(self.session_id.as_deref())
    }
}

pub fn require_session(raw: Option<&str>) -> AppResult<SessionId> {
    let raw = raw.ok_or_else(|| {
        AppError::Core(CoreError::Validation("session_id is required".into()))
    })?;
    Ok(SessionId::parse(raw)?)
}
