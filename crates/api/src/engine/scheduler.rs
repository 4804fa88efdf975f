//! Single-flight scheduler.
//!
//! One [`Scheduler`] owns the [`JobQueue`] behind a mutex. Request handlers
//! call [`Scheduler::submit`], [`Scheduler::cancel`] and the read-only
//! accessors; a single worker task ([`Scheduler::run`]) promotes the oldest
//! queued job whenever nothing is running and drives it through the
//! [`JobExecutor`]. The lock is never held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use kiln_core::error::{CoreError, PolicyError};
use kiln_core::generation::GenerationRequest;
use kiln_core::license::{MeterOutcome, UsageMeter};
use kiln_core::queue::{CancelOutcome, FailureKind, Job, JobOutcome, JobQueue, JobStatus};
use kiln_core::quota::{DailyStatus, DailyUsageTracker};
use kiln_core::scheduling::JobState;
use kiln_core::session::SessionId;
use kiln_core::types::JobId;
use kiln_events::{JobEvent, JobEventHub};
use kiln_pipeline::executor::{ExecutionReport, JobExecutor};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::history::{HistoryEntry, HistoryLog};
use crate::middleware::license::LicenseTier;

/// How long a terminal job stays pollable in the live queue.
pub const TERMINAL_RETENTION: Duration = Duration::from_secs(60);

/// Fallback wake-up in case a notification is missed.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a successful submission reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub job_id: JobId,
    /// Metered tokens only.
    pub meter: Option<MeterOutcome>,
    /// Free tier only.
    pub daily: Option<DailyStatus>,
}

/// How a subscriber joins a job's event stream.
#[derive(Debug)]
pub enum Attachment {
    /// The job is still active; events arrive on the receiver.
    Live(broadcast::Receiver<JobEvent>),
    /// The job already finished; this is its terminal event.
    Finished(JobEvent),
}

/// Queue view for one session, as polled by the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub queue_size: usize,
    pub user_position: Option<usize>,
    pub user_eta: Option<u64>,
    pub active_job_id: Option<JobId>,
}

pub struct Scheduler {
    queue: Mutex<JobQueue>,
    meter: Arc<UsageMeter>,
    daily: Arc<DailyUsageTracker>,
    hub: Arc<JobEventHub>,
    history: Arc<HistoryLog>,
    executor: Arc<dyn JobExecutor>,
    wake: Notify,
    retention: Duration,
}

impl Scheduler {
    pub fn new(
        capacity: usize,
        meter: Arc<UsageMeter>,
        daily: Arc<DailyUsageTracker>,
        hub: Arc<JobEventHub>,
        history: Arc<HistoryLog>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            queue: Mutex::new(JobQueue::new(capacity)),
            meter,
            daily,
            hub,
            history,
            executor,
            wake: Notify::new(),
            retention: TERMINAL_RETENTION,
        }
    }

    /// Override how long terminal jobs stay in the live queue.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn lock(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Admit a job or refuse it with a categorised error.
    ///
    /// Checks run in order under the queue lock, so concurrent submissions
    /// from one session admit exactly one: live job for the session,
    /// capacity, metered allowance, daily free allowance. Usage is only
    /// counted once the job is actually queued.
    pub fn submit(
        &self,
        job_id: JobId,
        session: SessionId,
        client_ip: &str,
        tier: &LicenseTier,
        request: GenerationRequest,
    ) -> Result<Admission, CoreError> {
        let today = Utc::now().date_naive();
        let mut queue = self.lock();
        queue.check_admission(&session)?;

        let meter = match tier.metered() {
            Some((token, limit)) => Some(self.meter.charge(token, limit)?),
            None => None,
        };

        let free = !tier.is_pro();
        if free {
            let status = self.daily.check(client_ip, today);
            if !status.allowed {
                return Err(PolicyError::DailyLimit {
                    used: status.used,
                    limit: status.limit,
                }
                .into());
            }
        }

        let job = Job::new(
            job_id.clone(),
            session.clone(),
            client_ip,
            tier.plan(),
            request,
            Utc::now(),
        );
        queue.push(job)?;
        let daily = free.then(|| self.daily.increment(client_ip, today));
        let position = queue.position(&job_id);
        drop(queue);

        tracing::info!(
            job_id = %job_id,
            session_id = %session,
            plan = ?tier.plan(),
            position = ?position,
            pro_remaining = ?meter.map(|m| m.remaining),
            daily_remaining = ?daily.map(|d| d.remaining),
            "Job queued",
        );
        self.wake.notify_one();

        Ok(Admission {
            job_id,
            meter,
            daily,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self, job_id: &str) -> JobStatus {
        self.lock().status(job_id)
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.lock().get(job_id).cloned()
    }

    pub fn snapshot(&self, session: &SessionId) -> QueueSnapshot {
        let queue = self.lock();
        let active = queue.active_job_for(session);
        let user_position = active.and_then(|j| queue.position(&j.job_id));
        QueueSnapshot {
            queue_size: queue.queued_count(),
            user_position,
            user_eta: user_position.map(|p| queue.eta_secs(p)),
            active_job_id: active.map(|j| j.job_id.clone()),
        }
    }

    /// `(queued, running)` counts for health reporting.
    pub fn load(&self) -> (usize, usize) {
        let queue = self.lock();
        (queue.queued_count(), usize::from(queue.running().is_some()))
    }

    /// Join a job's event stream on behalf of `session`.
    ///
    /// Runs under the queue lock so a job cannot finish between the
    /// ownership check and the subscription.
    pub fn attach(&self, job_id: &str, session: Option<&SessionId>) -> Result<Attachment, CoreError> {
        let queue = self.lock();
        let job = queue.get(job_id).ok_or_else(|| CoreError::NotFound {
            entity: "Job",
            id: job_id.to_string(),
        })?;
        if session != Some(&job.session_id) {
            tracing::warn!(
                job_id,
                session_id = ?session.map(SessionId::as_str),
                "Event stream refused: session does not own job",
            );
            return Err(CoreError::Forbidden("Session does not own this job".into()));
        }
        if job.state.is_terminal() {
            return Ok(Attachment::Finished(terminal_event(job)));
        }
        Ok(Attachment::Live(self.hub.subscribe(job_id)))
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel `job_id` for its owning session.
    ///
    /// A running job is only marked cancelled; the engine run is left to
    /// finish and its result discarded. Terminal or unknown jobs are a
    /// no-op.
    pub fn cancel(&self, job_id: &str, session: &SessionId) -> Result<CancelOutcome, CoreError> {
        let outcome = self.lock().cancel(job_id, session, Utc::now())?;
        match outcome {
            CancelOutcome::Removed | CancelOutcome::MarkedCancelled => {
                tracing::info!(job_id, session_id = %session, outcome = ?outcome, "Job cancelled");
                self.hub.publish(job_id, JobEvent::Cancelled);
                self.hub.close(job_id);
                if outcome == CancelOutcome::Removed {
                    // A removed job frees a slot ahead of others.
                    self.wake.notify_one();
                }
            }
            CancelOutcome::AlreadyTerminal | CancelOutcome::NotFound => {
                tracing::debug!(job_id, outcome = ?outcome, "Cancel was a no-op");
            }
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    /// Drain the queue until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("Scheduler started");
        loop {
            while !cancel.is_cancelled() && self.run_next().await {}
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Scheduler stopping");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Run the oldest queued job to completion. Returns `false` when there
    /// was nothing to start.
    pub async fn run_next(self: &Arc<Self>) -> bool {
        let Some(job) = self.lock().start_next(Utc::now()) else {
            return false;
        };
        let job_id = job.job_id.clone();
        tracing::info!(job_id = %job_id, session_id = %job.session_id, "Job started");

        let publisher = self.hub.publisher(&job_id);
        publisher.emit(JobEvent::Started);

        // A panicking executor must not take the worker down with it.
        let executor = Arc::clone(&self.executor);
        let events = publisher.clone();
        let task_job = job.clone();
        let joined = tokio::spawn(async move { executor.execute(&task_job, &events).await }).await;

        let (outcome, prompt_id) = match joined {
            Ok(Ok(ExecutionReport { artifacts, .. })) if artifacts.is_empty() => (
                JobOutcome::Failed {
                    kind: FailureKind::Engine,
                    message: "Engine produced no images".into(),
                },
                None,
            ),
            Ok(Ok(report)) => (JobOutcome::Completed(report.artifacts), report.prompt_id),
            Ok(Err(e)) => (
                JobOutcome::Failed {
                    kind: e.kind,
                    message: e.message,
                },
                None,
            ),
            Err(e) => (
                JobOutcome::Failed {
                    kind: FailureKind::Internal,
                    message: format!("Job task aborted: {e}"),
                },
                None,
            ),
        };

        let finished = {
            let mut queue = self.lock();
            let applied = queue.finalize(&job_id, outcome.clone(), Utc::now());
            queue.get(&job_id).cloned().map(|j| (applied, j))
        };

        match finished {
            Some((true, snapshot)) => {
                match &outcome {
                    JobOutcome::Completed(results) => {
                        tracing::info!(
                            job_id = %job_id,
                            images = results.len(),
                            duration_secs = ?snapshot.duration_secs(),
                            "Job completed",
                        );
                    }
                    JobOutcome::Failed { kind, message } => {
                        tracing::warn!(job_id = %job_id, kind = ?kind, error = %message, "Job failed");
                    }
                }
                publisher.emit(terminal_event(&snapshot));
                self.record_history(&snapshot, prompt_id).await;
            }
            Some((false, snapshot)) => {
                tracing::info!(job_id = %job_id, state = ?snapshot.state, "Job ended after cancellation, result discarded");
                self.record_history(&snapshot, prompt_id).await;
            }
            None => {
                tracing::warn!(job_id = %job_id, "Job vanished from the queue while running");
            }
        }
        self.hub.close(&job_id);
        self.schedule_removal(job_id);
        true
    }

    async fn record_history(&self, job: &Job, prompt_id: Option<String>) {
        let entry = HistoryEntry::from_job(job, prompt_id, Utc::now());
        if let Err(e) = self.history.record(entry).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to persist history");
        }
    }

    /// Drop the terminal job from the live queue after the retention window.
    fn schedule_removal(self: &Arc<Self>, job_id: JobId) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(scheduler.retention).await;
            if scheduler.lock().remove_terminal(&job_id).is_some() {
                tracing::debug!(job_id = %job_id, "Terminal job removed from live queue");
            }
        });
    }
}

/// The event a late subscriber sees for a job that already finished.
fn terminal_event(job: &Job) -> JobEvent {
    match job.state {
        JobState::Completed => JobEvent::Completed {
            results: job.results.clone(),
        },
        JobState::Cancelled => JobEvent::Cancelled,
        _ => JobEvent::Failed {
            message: job.error.clone().unwrap_or_else(|| "Job failed".into()),
            kind: job.failure_kind.unwrap_or(FailureKind::Internal),
        },
    }
}
