//! Per-job broadcast channels.
//!
//! Publishing never blocks: each channel is a bounded
//! `tokio::sync::broadcast`, so a slow subscriber falls behind (and sees
//! `RecvError::Lagged`) instead of holding up the scheduler or the other
//! subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kiln_core::queue::{Artifact, FailureKind};
use kiln_core::types::JobId;
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// Something that happened to a job, as seen by its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// The worker picked the job up.
    Started,

    /// Sampler step `step` of `total`.
    Progress { step: u32, total: u32 },

    /// A preview image as a data URL.
    Preview { image: String },

    Completed { results: Vec<Artifact> },

    #[serde(rename = "error")]
    Failed { message: String, kind: FailureKind },

    Cancelled,
}

impl JobEvent {
    /// No further events follow a terminal one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// JobEventHub
// ---------------------------------------------------------------------------

/// Default buffer capacity for each job's channel.
const DEFAULT_CAPACITY: usize = 256;

/// Registry of live per-job channels.
///
/// Shared via `Arc<JobEventHub>` between the scheduler, the executor and
/// the WebSocket handler.
pub struct JobEventHub {
    capacity: usize,
    channels: Mutex<HashMap<JobId, broadcast::Sender<JobEvent>>>,
}

impl JobEventHub {
    /// Create a hub whose per-job channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `job_id`, creating its channel if needed.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<JobEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to every current subscriber of `job_id`.
    ///
    /// Returns how many subscribers received it. Zero subscribers is fine:
    /// the event is dropped.
    pub fn publish(&self, job_id: &str, event: JobEvent) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        match channels.get(job_id) {
            // Ignore the SendError — it only means there are zero receivers.
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the job's channel. Subscribers drain what is buffered and then
    /// observe `RecvError::Closed`.
    pub fn close(&self, job_id: &str) {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        if removed.is_some() {
            tracing::trace!(job_id, "Closed job event channel");
        }
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// A publisher bound to `job_id`.
    pub fn publisher(self: &Arc<Self>, job_id: &str) -> JobEventPublisher {
        JobEventPublisher {
            hub: Arc::clone(self),
            job_id: job_id.to_string(),
        }
    }
}

impl Default for JobEventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Hub handle for one job.
#[derive(Clone)]
pub struct JobEventPublisher {
    hub: Arc<JobEventHub>,
    job_id: JobId,
}

impl JobEventPublisher {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn emit(&self, event: JobEvent) {
        self.hub.publish(&self.job_id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn subscribers_only_see_their_job() {
        let hub = JobEventHub::default();
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        hub.publish("a", JobEvent::Progress { step: 1, total: 4 });
        hub.publish("b", JobEvent::Started);

        assert_eq!(a.recv().await.unwrap(), JobEvent::Progress { step: 1, total: 4 });
        assert_eq!(b.recv().await.unwrap(), JobEvent::Started);
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_delivers_buffered_events_then_ends() {
        let hub = JobEventHub::default();
        let mut rx = hub.subscribe("a");
        hub.publish(
            "a",
            JobEvent::Failed {
                message: "engine down".into(),
                kind: FailureKind::Engine,
            },
        );
        hub.close("a");

        assert!(rx.recv().await.unwrap().is_terminal());
        assert_eq!(rx.recv().await, Err(RecvError::Closed));
        assert_eq!(hub.subscriber_count("a"), 0);
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let hub = JobEventHub::default();
        assert_eq!(hub.publish("nobody", JobEvent::Started), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking_others() {
        let hub = JobEventHub::new(2);
        let mut slow = hub.subscribe("a");
        let mut fast = hub.subscribe("a");

        for step in 0..5 {
            hub.publish("a", JobEvent::Progress { step, total: 5 });
            assert_eq!(
                fast.recv().await.unwrap(),
                JobEvent::Progress { step, total: 5 }
            );
        }
        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn wire_shape_uses_type_tags() {
        let json = serde_json::to_value(JobEvent::Failed {
            message: "x".into(),
            kind: FailureKind::Asset,
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "asset");

        let json = serde_json::to_value(JobEvent::Progress { step: 2, total: 4 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "progress", "step": 2, "total": 4}));
    }

    #[tokio::test]
    async fn publisher_targets_its_job() {
        let hub = Arc::new(JobEventHub::default());
        let mut rx = hub.subscribe("j1");
        hub.publisher("j1").emit(JobEvent::Cancelled);
        assert_eq!(rx.recv().await.unwrap(), JobEvent::Cancelled);
    }
}
