//! Bounded, newest-first log of finished jobs.
//!
//! The whole log lives in memory and is rewritten to a JSON file after
//! every append (temp file, then rename). A missing or unreadable file at
//! startup yields an empty log.

use std::path::{Path, PathBuf};

use kiln_core::generation::{AssetSpec, PostProcess};
use kiln_core::queue::{Artifact, FailureKind, Job};
use kiln_core::scheduling::JobState;
use kiln_core::session::SessionId;
use kiln_core::types::{JobId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Entries kept before the oldest is dropped.
pub const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: JobId,
    pub session_id: String,
    pub state: JobState,
    /// Engine-side handle, when the job got that far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    pub timestamp: Timestamp,
    pub prompt: String,
    pub negative: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub assets: Vec<AssetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_processing: Option<PostProcess>,
    #[serde(default)]
    pub results: Vec<Artifact>,
    /// First artifact URL, for list views.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl HistoryEntry {
    /// Snapshot a terminal job.
    pub fn from_job(job: &Job, prompt_id: Option<String>, now: Timestamp) -> Self {
        let p = job.parameters.as_ref();
        Self {
            job_id: job.job_id.clone(),
            session_id: job.session_id.to_string(),
            state: job.state,
            prompt_id,
            timestamp: job.completed_at.unwrap_or(now),
            prompt: p.prompt.clone(),
            negative: p.negative_prompt().to_string(),
            width: p.width(),
            height: p.height(),
            steps: p.steps(),
            seed: p.seed,
            assets: p.assets.clone(),
            post_processing: p.post_processing.clone(),
            results: job.results.clone(),
            image_url: job.results.first().map(|a| a.url.clone()),
            error: job.error.clone(),
            failure_kind: job.failure_kind,
            duration_secs: job.duration_secs(),
        }
    }
}

pub struct HistoryLog {
    path: PathBuf,
    capacity: usize,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl HistoryLog {
    /// Load the log at `path`, starting empty if it cannot be read.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "History file unreadable, starting empty");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not open history file");
                Vec::new()
            }
        };
        Self {
            path,
            capacity: HISTORY_CAPACITY,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepend `entry` and persist the log.
    ///
    /// The in-memory log is updated even when the write fails.
    pub async fn record(&self, entry: HistoryEntry) -> std::io::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(0, entry);
        entries.truncate(self.capacity);
        let json = serde_json::to_vec_pretty(&*entries).map_err(std::io::Error::other)?;
        write_atomic(&self.path, &json).await
    }

    pub async fn for_session(&self, session: &SessionId) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.session_id == session.as_str())
            .cloned()
            .collect()
    }

    pub async fn find(&self, job_id: &str) -> Option<HistoryEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.job_id == job_id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_core::generation::GenerationRequest;
    use kiln_core::license::Plan;

    fn finished_job(id: &str, sid: &str) -> Job {
        let request = GenerationRequest {
            prompt: "a lighthouse at dusk".into(),
            ..Default::default()
        };
        let mut job = Job::new(
            id.into(),
            SessionId::parse(sid).unwrap(),
            "10.0.0.1",
            Plan::Free,
            request,
            Utc::now(),
        );
        job.state = JobState::Completed;
        job.results = vec![Artifact {
            url: format!("/outputs/{sid}/kiln_000001.png?session_id={sid}"),
            filename: "kiln_000001.png".into(),
        }];
        job
    }

    #[tokio::test]
    async fn keeps_newest_first_and_caps_length() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::open(dir.path().join("history.json")).await;

        for i in 0..(HISTORY_CAPACITY + 5) {
            let job = finished_job(&format!("job-{i}"), "sid_history1");
            log.record(HistoryEntry::from_job(&job, None, Utc::now()))
                .await
                .unwrap();
        }

        assert_eq!(log.len().await, HISTORY_CAPACITY);
        let sid = SessionId::parse("sid_history1").unwrap();
        let entries = log.for_session(&sid).await;
        assert_eq!(entries[0].job_id, format!("job-{}", HISTORY_CAPACITY + 4));
        assert!(log.find("job-0").await.is_none());
    }

    #[tokio::test]
    async fn survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        {
            let log = HistoryLog::open(&path).await;
            let job = finished_job("job-a", "sid_history2");
            log.record(HistoryEntry::from_job(&job, Some("p-1".into()), Utc::now()))
                .await
                .unwrap();
        }

        let reopened = HistoryLog::open(&path).await;
        let entry = reopened.find("job-a").await.unwrap();
        assert_eq!(entry.prompt_id.as_deref(), Some("p-1"));
        assert_eq!(
            entry.image_url.as_deref(),
            Some("/outputs/sid_history2/kiln_000001.png?session_id=sid_history2")
        );
        assert_eq!(entry.width, 1024);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let log = HistoryLog::open(&path).await;
        assert_eq!(log.len().await, 0);
    }

    #[tokio::test]
    async fn entries_are_scoped_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::open(dir.path().join("history.json")).await;
        for (id, sid) in [("a", "sid_owner01"), ("b", "sid_other01"), ("c", "sid_owner01")] {
            log.record(HistoryEntry::from_job(&finished_job(id, sid), None, Utc::now()))
                .await
                .unwrap();
        }
        let owner = SessionId::parse("sid_owner01").unwrap();
        let ids: Vec<_> = log
            .for_session(&owner)
            .await
            .into_iter()
            .map(|e| e.job_id)
            .collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
