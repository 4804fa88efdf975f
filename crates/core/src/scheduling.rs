//! Job lifecycle states and the transitions between them.
//!
//! ```text
//! queued --> running --> completed
//!                   \--> failed
//!                   \--> cancelled
//! ```
//!
//! A queued job that is cancelled is removed outright rather than moved to
//! `cancelled`, so `queued` has a single successor.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// The job id is not (or no longer) known.
    Unknown,
}

impl JobState {
    /// Returns the set of states reachable from `self`.
    ///
    /// Terminal states and `Unknown` return an empty slice.
    pub fn valid_transitions(self) -> &'static [JobState] {
        match self {
            JobState::Queued => &[JobState::Running],
            JobState::Running => &[JobState::Completed, JobState::Failed, JobState::Cancelled],
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Unknown => &[],
        }
    }

    pub fn can_transition(self, to: JobState) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(self, to: JobState) -> Result<(), String> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(format!("Invalid transition: {} -> {}", self.name(), to.name()))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Queued or running: counts against the per-session concurrency limit.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn name(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Unknown => "unknown",
        }
    }
}
