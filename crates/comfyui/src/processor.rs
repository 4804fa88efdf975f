//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI connection, forwards progress and
//! preview frames for one prompt, and resolves once the engine reports
//! that nothing is left to execute for it.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::client::WsStream;
use crate::events::EngineEvent;
use crate::messages::{concerns, parse_message, parse_preview_frame, ComfyUIMessage};

/// Why a prompt did not complete on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// The engine reported an execution error.
    #[error("Execution failed at node {node}: {message}")]
    Execution { node: String, message: String },

    /// The engine interrupted the prompt.
    #[error("Execution was interrupted by the engine")]
    Interrupted,

    /// The socket closed before the prompt finished.
    #[error("Engine connection closed before completion")]
    Disconnected,

    #[error("WebSocket receive error: {0}")]
    Receive(String),
}

/// Process frames until `prompt_id` finishes.
///
/// Forwarded events are sent on an unbounded channel so a slow consumer
/// never stalls the socket. A dropped receiver is ignored.
pub async fn await_completion(
    ws_stream: &mut WsStream,
    prompt_id: &str,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<(), ProcessorError> {
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if let Some(done) = handle_text_message(&text, prompt_id, events) {
                    return done;
                }
            }
            Ok(Message::Binary(bytes)) => {
                if let Some(preview) = parse_preview_frame(&bytes) {
                    let _ = events.send(EngineEvent::Preview {
                        format: preview.format,
                        data: preview.data,
                    });
                }
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(prompt_id, ?frame, "ComfyUI WebSocket closed");
                return Err(ProcessorError::Disconnected);
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(prompt_id, error = %e, "WebSocket receive error");
                return Err(ProcessorError::Receive(e.to_string()));
            }
        }
    }
    Err(ProcessorError::Disconnected)
}

/// Handle one text frame. `Some` means the prompt reached an end state.
fn handle_text_message(
    text: &str,
    prompt_id: &str,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Option<Result<(), ProcessorError>> {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::trace!(error = %e, "Skipping unrecognised ComfyUI message");
            return None;
        }
    };

    match msg {
        ComfyUIMessage::ExecutionStart(data) if concerns(data.prompt_id.as_deref(), prompt_id) => {
            tracing::debug!(prompt_id, "Execution started");
            let _ = events.send(EngineEvent::ExecutionStarted {
                prompt_id: prompt_id.to_string(),
            });
            None
        }
        ComfyUIMessage::Progress(data) if concerns(data.prompt_id.as_deref(), prompt_id) => {
            let _ = events.send(EngineEvent::Progress {
                step: data.value,
                total: data.max,
            });
            None
        }
        ComfyUIMessage::Executing(data)
            if data.node.is_none() && data.prompt_id.as_deref() == Some(prompt_id) =>
        {
            tracing::info!(prompt_id, "Execution completed (all nodes done)");
            Some(Ok(()))
        }
        ComfyUIMessage::ExecutionError(data) if data.prompt_id == prompt_id => {
            tracing::error!(
                prompt_id,
                node_id = ?data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            Some(Err(ProcessorError::Execution {
                node: data.node_id.unwrap_or_else(|| "?".into()),
                message: data.exception_message,
            }))
        }
        ComfyUIMessage::ExecutionInterrupted(data)
            if data.prompt_id.as_deref() == Some(prompt_id) =>
        {
            Some(Err(ProcessorError::Interrupted))
        }
        ComfyUIMessage::Status(data) => {
            tracing::trace!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            None
        }
        _ => None,
    }
}
