//! WebSocket client for connecting to the ComfyUI push channel.
//!
//! [`ComfyUIClient`] holds the WebSocket base URL. Each execution opens
//! its own [`ComfyUIConnection`] with a fresh client id, and submits its
//! graph under that same id so the engine routes events back to it.

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Raw WebSocket stream type used throughout the crate.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for the ComfyUI push channel.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection.
#[derive(Debug)]
pub struct ComfyUIConnection {
    /// Client id sent during the handshake; submissions must reuse it.
    pub client_id: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://127.0.0.1:8188`.
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    /// WebSocket base URL.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect with a freshly generated client id (UUID v4).
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        self.connect_as(&uuid::Uuid::new_v4().to_string()).await
    }

    /// Connect to `{ws_url}/ws?clientId={client_id}`.
    pub async fn connect_as(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::debug!(client_id = %client_id, ws_url = %self.ws_url, "Connected to ComfyUI");

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Retries were abandoned because shutdown was requested.
    #[error("Connection attempt cancelled")]
    Cancelled,
}
