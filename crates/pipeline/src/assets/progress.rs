//! Per-session import progress for pollers.
//!
//! Each session has at most one entry. Terminal entries carry an expiry
//! and read as idle once it passes.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use kiln_core::session::SessionId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// How long a finished import stays visible.
pub const FINISHED_TTL: Duration = Duration::from_secs(60);

/// How long a "nothing to download" result stays visible.
pub const DEDUP_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Idle,
    Downloading,
    Uploading,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportProgress {
    pub status: ImportStatus,
    pub bytes: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImportProgress {
    pub fn idle() -> Self {
        Self::with_status(ImportStatus::Idle, 0, 0)
    }

    pub fn downloading(bytes: u64, total: u64) -> Self {
        Self::with_status(ImportStatus::Downloading, bytes, total)
    }

    pub fn uploading(bytes: u64, total: u64) -> Self {
        Self::with_status(ImportStatus::Uploading, bytes, total)
    }

    pub fn done(bytes: u64) -> Self {
        Self::with_status(ImportStatus::Done, bytes, bytes)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::with_status(ImportStatus::Error, 0, 0)
        }
    }

    fn with_status(status: ImportStatus, bytes: u64, total: u64) -> Self {
        Self {
            status,
            bytes,
            total,
            error: None,
        }
    }
}

struct Entry {
    progress: ImportProgress,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct ProgressTracker {
    entries: Mutex<HashMap<SessionId, Entry>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record in-flight progress. Never expires on its own.
    pub fn update(&self, session: &SessionId, progress: ImportProgress) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session.clone(),
                Entry {
                    progress,
                    expires_at: None,
                },
            );
    }

    /// Record a terminal state that disappears after `ttl`.
    pub fn finish(&self, session: &SessionId, progress: ImportProgress, ttl: Duration) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session.clone(),
                Entry {
                    progress,
                    expires_at: Some(Instant::now() + ttl),
                },
            );
    }

    pub fn get(&self, session: &SessionId) -> ImportProgress {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(session) {
            Some(entry) if entry.expires_at.is_some_and(|t| t <= Instant::now()) => {
                entries.remove(session);
                ImportProgress::idle()
            }
            Some(entry) => entry.progress.clone(),
            None => ImportProgress::idle(),
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| e.expires_at.is_none_or(|t| t > now));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::parse("sid_progress1").unwrap()
    }

    #[tokio::test]
    async fn unknown_session_reads_idle() {
        assert_eq!(ProgressTracker::new().get(&sid()).status, ImportStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_state_expires() {
        let tracker = ProgressTracker::new();
        tracker.update(&sid(), ImportProgress::downloading(10, 100));
        assert_eq!(tracker.get(&sid()).bytes, 10);

        tracker.finish(&sid(), ImportProgress::done(100), FINISHED_TTL);
        assert_eq!(tracker.get(&sid()).status, ImportStatus::Done);

        tokio::time::advance(FINISHED_TTL + Duration::from_millis(1)).await;
        assert_eq!(tracker.get(&sid()).status, ImportStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_entries_survive_pruning() {
        let tracker = ProgressTracker::new();
        tracker.update(&sid(), ImportProgress::downloading(1, 2));
        let other = SessionId::parse("sid_progress2").unwrap();
        tracker.finish(&other, ImportProgress::failed("boom"), DEDUP_TTL);

        tokio::time::advance(DEDUP_TTL * 2).await;
        assert_eq!(tracker.prune(), 1);
        assert_eq!(tracker.get(&sid()).status, ImportStatus::Downloading);
    }

    #[test]
    fn error_carries_its_message_on_the_wire() {
        let json = serde_json::to_value(ImportProgress::failed("HTML page")).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "HTML page");
        let json = serde_json::to_value(ImportProgress::idle()).unwrap();
        assert!(json.get("error").is_none());
    }
}
