//! Events the bridge forwards while a prompt executes.
//!
//! These are engine-level and carry no job identity; the caller maps them
//! onto its own subscribers.

use crate::messages::PreviewFormat;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The engine picked up the prompt.
    ExecutionStarted { prompt_id: String },

    /// Sampler step `step` of `total`.
    Progress { step: u32, total: u32 },

    /// A decoded preview image.
    Preview { format: PreviewFormat, data: Vec<u8> },
}
