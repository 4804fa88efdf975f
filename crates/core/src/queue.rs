//! The global job queue.
//!
//! [`JobQueue`] is a plain owned collection; callers serialize access to it
//! (the API layer keeps it behind a single mutex). It enforces:
//!
//! - at most one job in state `running`,
//! - at most one `queued`/`running` job per session,
//! - a hard capacity; over-capacity pushes are refused, never dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CapacityError, CoreError};
use crate::generation::GenerationRequest;
use crate::license::Plan;
use crate::scheduling::JobState;
use crate::session::SessionId;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 500;

/// Completed durations kept for the moving average.
pub const DURATION_WINDOW: usize = 10;

/// ETA basis when nothing has completed yet.
pub const DEFAULT_ESTIMATE_SECS: f64 = 30.0;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A stable reference to a rendered artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub url: String,
    pub filename: String,
}

/// Which stage a failed job died in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Graph,
    Asset,
    Engine,
    Internal,
}

/// How a running job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Vec<Artifact>),
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub client_ip: String,
    pub plan: Plan,
    pub state: JobState,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub parameters: Arc<GenerationRequest>,
    pub results: Vec<Artifact>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

impl Job {
    pub fn new(
        job_id: JobId,
        session_id: SessionId,
        client_ip: impl Into<String>,
        plan: Plan,
        parameters: GenerationRequest,
        now: Timestamp,
    ) -> Self {
        Self {
            job_id,
            session_id,
            client_ip: client_ip.into(),
            plan,
            state: JobState::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            parameters: Arc::new(parameters),
            results: Vec::new(),
            error: None,
            failure_kind: None,
        }
    }

    /// Wall-clock run time, once both ends are known.
    pub fn duration_secs(&self) -> Option<f64> {
        let (start, end) = (self.started_at?, self.completed_at?);
        Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Poll-friendly snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    /// Zero-based position among queued jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub eta_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    pub results: Vec<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl JobStatus {
    pub fn unknown(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Unknown,
            queue_position: None,
            eta_seconds: 0,
            created_at: None,
            results: Vec::new(),
            error: None,
            failure_kind: None,
        }
    }
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued and is gone.
    Removed,
    /// The job was running; it is marked cancelled, the engine run continues.
    MarkedCancelled,
    /// Already terminal. Nothing changed.
    AlreadyTerminal,
    /// Unknown id. Nothing changed.
    NotFound,
}

// ---------------------------------------------------------------------------
// Duration tracking
// ---------------------------------------------------------------------------

/// Moving average over the last [`DURATION_WINDOW`] completed runs.
#[derive(Debug, Clone, Default)]
pub struct DurationTracker {
    samples: VecDeque<f64>,
}

impl DurationTracker {
    pub fn record(&mut self, secs: f64) {
        if self.samples.len() == DURATION_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(secs);
    }

    pub fn average_secs(&self) -> f64 {
        if self.samples.is_empty() {
            DEFAULT_ESTIMATE_SECS
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
    capacity: usize,
    durations: DurationTracker,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            capacity,
            durations: DurationTracker::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    pub fn running(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| j.state == JobState::Running)
    }

    /// The session's queued or running job, if any.
    pub fn active_job_for(&self, session: &SessionId) -> Option<&Job> {
        self.jobs
            .iter()
            .find(|j| &j.session_id == session && j.state.is_active())
    }

    pub fn queued_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Queued)
            .count()
    }

    /// Whether `session` could enqueue a job right now.
    ///
    /// The concurrency check runs first so a caller with a live job is
    /// pointed back at it even when the queue is also full.
    pub fn check_admission(&self, session: &SessionId) -> Result<(), CoreError> {
        if let Some(existing) = self.active_job_for(session) {
            return Err(CapacityError::ConcurrentLimit {
                job_id: existing.job_id.clone(),
            }
            .into());
        }
        if self.jobs.len() >= self.capacity {
            return Err(CapacityError::QueueFull {
                capacity: self.capacity,
            }
            .into());
        }
        Ok(())
    }

    pub fn push(&mut self, job: Job) -> Result<(), CoreError> {
        self.check_admission(&job.session_id)?;
        self.jobs.push_back(job);
        Ok(())
    }

    /// Zero-based position among queued jobs.
    pub fn position(&self, job_id: &str) -> Option<usize> {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Queued)
            .position(|j| j.job_id == job_id)
    }

    pub fn average_duration_secs(&self) -> f64 {
        self.durations.average_secs()
    }

    /// ETA for the queued job at `position`.
    pub fn eta_secs(&self, position: usize) -> u64 {
        ((position + 1) as f64 * self.average_duration_secs()).round() as u64
    }

    pub fn status(&self, job_id: &str) -> JobStatus {
        let Some(job) = self.get(job_id) else {
            return JobStatus::unknown(job_id);
        };
        let queue_position = self.position(job_id);
        JobStatus {
            job_id: job.job_id.clone(),
            state: job.state,
            queue_position,
            eta_seconds: queue_position.map_or(0, |p| self.eta_secs(p)),
            created_at: Some(job.created_at),
            results: job.results.clone(),
            error: job.error.clone(),
            failure_kind: job.failure_kind,
        }
    }

    /// Promote the oldest queued job to `running`.
    ///
    /// Returns `None` while another job is running or nothing is queued.
    pub fn start_next(&mut self, now: Timestamp) -> Option<Job> {
        if self.running().is_some() {
            return None;
        }
        let job = self.jobs.iter_mut().find(|j| j.state == JobState::Queued)?;
        job.state = JobState::Running;
        job.started_at = Some(now);
        Some(job.clone())
    }

    /// Record how a running job ended.
    ///
    /// Applies at most once per job: returns `false` when the job is gone or
    /// no longer running (e.g. cancelled while in flight).
    pub fn finalize(&mut self, job_id: &str, outcome: JobOutcome, now: Timestamp) -> bool {
        let Some(job) = self.jobs.iter_mut().find(|j| j.job_id == job_id) else {
            return false;
        };
        if job.state != JobState::Running {
            return false;
        }
        job.completed_at = Some(now);
        match outcome {
            JobOutcome::Completed(results) => {
                job.state = JobState::Completed;
                job.results = results;
                if let Some(secs) = job.duration_secs() {
                    self.durations.record(secs);
                }
            }
            JobOutcome::Failed { kind, message } => {
                job.state = JobState::Failed;
                job.error = Some(message);
                job.failure_kind = Some(kind);
            }
        }
        true
    }

    /// Cancel a job on behalf of `session`.
    ///
    /// Only the owning session may cancel. Cancelling a terminal or unknown
    /// job is a no-op.
    pub fn cancel(
        &mut self,
        job_id: &str,
        session: &SessionId,
        now: Timestamp,
    ) -> Result<CancelOutcome, CoreError> {
        let Some(index) = self.jobs.iter().position(|j| j.job_id == job_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        if &self.jobs[index].session_id != session {
            return Err(CoreError::Forbidden(
                "Job belongs to another session".into(),
            ));
        }
        match self.jobs[index].state {
            JobState::Queued => {
                self.jobs.remove(index);
                Ok(CancelOutcome::Removed)
            }
            JobState::Running => {
                let job = &mut self.jobs[index];
                job.state = JobState::Cancelled;
                job.completed_at = Some(now);
                job.error = Some("Cancelled by user".into());
                Ok(CancelOutcome::MarkedCancelled)
            }
            _ => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    /// Drop a terminal job from the live queue.
    ///
    /// Active jobs are never removed this way.
    pub fn remove_terminal(&mut self, job_id: &str) -> Option<Job> {
        let index = self
            .jobs
            .iter()
            .position(|j| j.job_id == job_id && j.state.is_terminal())?;
        self.jobs.remove(index)
    }
}
