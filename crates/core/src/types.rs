/// Jobs are keyed by an opaque, unguessable string (UUID v4, optionally
/// prefixed for automation callers).
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh job identifier.
pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}
