use crate::content_policy::ContentCategory;
use crate::types::JobId;

/// Domain error shared by every crate in the workspace.
///
/// The HTTP layer maps each variant onto a status code and the stable
/// machine-readable code returned by [`CoreError::code`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Content screening or licensing refused the request.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The queue or a rate governor refused the request.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Refusals that depend on who the caller is and what they asked for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Matched the always-blocked vocabulary. No tier unlocks it.
    #[error("Content blocked by safety filter ({0})")]
    ContentBlocked(ContentCategory),

    /// Matched the tier-gated vocabulary on an unprivileged request.
    #[error("Content requires a PRO license ({0})")]
    UpgradeRequired(ContentCategory),

    /// The operation itself is reserved for privileged callers.
    #[error("This feature requires a PRO license")]
    LicenseRequired,

    /// A metered license has no uses left.
    #[error("License usage limit reached ({remaining} of {limit} remaining)")]
    LimitReached { remaining: u32, limit: u32 },

    /// The caller's network address used up today's free allowance.
    #[error("Daily free limit reached ({used}/{limit})")]
    DailyLimit { used: u32, limit: u32 },
}

/// Refusals caused by shared capacity rather than by the request itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    #[error("Queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    /// The session already has a queued or running job.
    #[error("Session already has an active job ({job_id})")]
    ConcurrentLimit { job_id: JobId },

    #[error("Too many requests, slow down")]
    RateLimited,
}

/// Coarse grouping used for logging and metrics-free triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Policy,
    Capacity,
    Auth,
    Internal,
}

impl CoreError {
    /// Stable machine-readable code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Policy(p) => match p {
                PolicyError::ContentBlocked(_) => "CONTENT_BLOCKED",
                PolicyError::UpgradeRequired(_) | PolicyError::LicenseRequired => "PRO_REQUIRED",
                PolicyError::LimitReached { .. } => "PRO_LIMIT_REACHED",
                PolicyError::DailyLimit { .. } => "DAILY_LIMIT",
            },
            CoreError::Capacity(c) => match c {
                CapacityError::QueueFull { .. } => "QUEUE_FULL",
                CapacityError::ConcurrentLimit { .. } => "CONCURRENT_LIMIT",
                CapacityError::RateLimited => "RATE_LIMITED",
            },
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::NotFound { .. } => ErrorCategory::NotFound,
            CoreError::Validation(_) => ErrorCategory::Validation,
            CoreError::Policy(_) => ErrorCategory::Policy,
            CoreError::Capacity(_) => ErrorCategory::Capacity,
            CoreError::Unauthorized(_) | CoreError::Forbidden(_) => ErrorCategory::Auth,
            CoreError::Internal(_) => ErrorCategory::Internal,
        }
    }
}
