//! ComfyUI WebSocket message types and parser.
//!
//! Text frames are JSON shaped `{"type": "<kind>", "data": {...}}` and
//! deserialize into [`ComfyUIMessage`]. Binary frames carry preview images
//! behind an 8-byte header and are decoded by [`parse_preview_frame`].

use serde::Deserialize;

/// All ComfyUI WebSocket message types the bridge reacts to.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(PromptRef),

    /// A node is executing, or the prompt finished when `node` is `None`.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step progress from a sampler node.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node finished and produced output.
    #[serde(rename = "executed")]
    Executed(PromptRef),

    /// The prompt finished without running anything new.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptRef),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    /// Execution was interrupted on the engine side.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(PromptRef),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload carrying only the prompt it belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `executing` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: u32,
    pub max: u32,
    /// Present on current engine builds; older ones omit it.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Belongs to `prompt_id`, or carries no prompt id at all.
///
/// Progress frames from older engines lack a prompt id; since each
/// connection uses its own client id they can only be ours.
pub fn concerns(prompt_id: Option<&str>, ours: &str) -> bool {
    prompt_id.is_none_or(|p| p == ours)
}

// ---------------------------------------------------------------------------
// Binary preview frames
// ---------------------------------------------------------------------------

/// Binary event type for preview images.
const PREVIEW_IMAGE_EVENT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewFormat {
    Jpeg,
    Png,
}

impl PreviewFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            PreviewFormat::Jpeg => "image/jpeg",
            PreviewFormat::Png => "image/png",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewFrame {
    pub format: PreviewFormat,
    pub data: Vec<u8>,
}

/// Decode a binary frame: `u32 BE event | u32 BE image format | bytes`.
///
/// Returns `None` for non-preview events and truncated frames.
pub fn parse_preview_frame(frame: &[u8]) -> Option<PreviewFrame> {
    if frame.len() <= 8 {
        return None;
    }
    let event = u32::from_be_bytes(frame[0..4].try_into().ok()?);
    if event != PREVIEW_IMAGE_EVENT {
        return None;
    }
    let format = match u32::from_be_bytes(frame[4..8].try_into().ok()?) {
        2 => PreviewFormat::Png,
        _ => PreviewFormat::Jpeg,
    };
    Some(PreviewFrame {
        format,
        data: frame[8..].to_vec(),
    })
}
