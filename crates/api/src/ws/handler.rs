use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use kiln_core::session::SessionId;
use kiln_core::types::JobId;
use kiln_events::JobEvent;
use tokio::sync::broadcast::error::RecvError;

use crate::engine::Attachment;
use crate::error::{AppError, AppResult};
use crate::handlers::SessionQuery;
use crate::state::AppState;

/// Interval between keep-alive pings on an idle stream.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// GET /api/jobs/{id}/events?session_id= (WebSocket)
///
/// Ownership is checked before the upgrade, so a refused subscriber gets a
/// plain JSON error. A job that already finished yields its terminal event
/// and the socket closes.
pub async fn job_events(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    Query(query): Query<SessionQuery>,
) -> AppResult<Response> {
    let session = query
        .session_id
        .as_deref()
        .map(SessionId::parse)
        .transpose()?;
    let attachment = state.scheduler.attach(&job_id, session.as_ref())?;
    let ws = ws.map_err(|e| AppError::BadRequest(format!("WebSocket upgrade required: {e}")))?;

    Ok(ws
        .on_upgrade(move |socket| stream_events(socket, job_id, attachment))
        .into_response())
}

/// Forward events until the terminal one, the client leaves, or the
/// channel closes.
async fn stream_events(socket: WebSocket, job_id: JobId, attachment: Attachment) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Event stream connected");

    let (mut sink, mut stream) = socket.split();
    let mut rx = match attachment {
        Attachment::Live(rx) => rx,
        Attachment::Finished(event) => {
            let _ = send_event(&mut sink, &event).await;
            let _ = sink.send(Message::Close(None)).await;
            tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Replayed terminal event");
            return;
        }
    };

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => {
                    if send_event(&mut sink, &event).await.is_err() {
                        tracing::debug!(conn_id = %conn_id, "WebSocket sink closed");
                        break;
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(conn_id = %conn_id, job_id = %job_id, skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    tracing::debug!(conn_id = %conn_id, job_id = %job_id, "Event stream disconnected");
}

async fn send_event<S>(sink: &mut S, event: &JobEvent) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize job event");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await
}
