//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, history retrieval,
//! artifact download, model listing and refresh) using [`reqwest`].

use std::path::Path;

use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

/// Loader node whose input schema lists the advertised weight assets.
const ASSET_LOADER_NODE: &str = "LoraLoader";
const ASSET_INPUT_FIELD: &str = "lora_name";

/// HTTP client for the ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the engine's own queue.
    #[serde(default)]
    pub number: i32,
}

/// An image listed in a history entry's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_output_kind")]
    pub kind: String,
}

fn default_output_kind() -> String {
    "output".to_string()
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The response parsed but did not have the expected shape.
    #[error("Unexpected ComfyUI response: {0}")]
    Malformed(String),

    /// Writing a downloaded artifact failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComfyUIApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the workflow and the client id of the
    /// WebSocket that should receive its events.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The returned JSON is
    /// keyed by prompt id and holds `outputs` and `status`.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Stream one output image to `dest`. Returns the byte count.
    ///
    /// Sends `GET /view?filename=..&subfolder=..&type=..`.
    pub async fn download_output(
        &self,
        image: &OutputImage,
        dest: &Path,
    ) -> Result<u64, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// List the weight assets the engine currently advertises.
    ///
    /// Reads the `lora_name` choices from `GET /object_info/LoraLoader`.
    pub async fn list_assets(&self) -> Result<Vec<String>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/object_info/{ASSET_LOADER_NODE}", self.api_url))
            .send()
            .await?;
        let info: serde_json::Value = Self::parse_response(response).await?;
        parse_asset_choices(&info)
    }

    /// Ask the engine to rescan its model folders.
    ///
    /// Tries `POST /refresh` first and falls back to
    /// `POST /extra_model_paths` on builds that lack it.
    pub async fn refresh_models(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/refresh", self.api_url))
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        tracing::debug!(
            status = response.status().as_u16(),
            "Refresh endpoint unavailable, trying extra_model_paths",
        );

        let response = self
            .client
            .post(format!("{}/extra_model_paths", self.api_url))
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Engine health and device info from `GET /system_stats`.
    pub async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Extract `LoraLoader.input.required.lora_name[0]` from an object_info
/// response.
pub fn parse_asset_choices(info: &serde_json::Value) -> Result<Vec<String>, ComfyUIApiError> {
    let choices = info
        .get(ASSET_LOADER_NODE)
        .and_then(|n| n.pointer(&format!("/input/required/{ASSET_INPUT_FIELD}/0")))
        .and_then(|v| v.as_array())
        .ok_or_else(|| ComfyUIApiError::Malformed("object_info has no lora_name choices".into()))?;

    Ok(choices
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

/// Every image listed under `history[prompt_id].outputs.*.images`.
pub fn output_images(history: &serde_json::Value, prompt_id: &str) -> Vec<OutputImage> {
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|h| h.get("outputs"))
        .and_then(|o| o.as_object())
    else {
        return Vec::new();
    };

    outputs
        .values()
        .filter_map(|node| node.get("images").and_then(|i| i.as_array()))
        .flatten()
        .filter_map(|img| serde_json::from_value::<OutputImage>(img.clone()).ok())
        .collect()
}

/// Where a prompt stands according to the history store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryState {
    /// Not in history yet.
    Pending,
    Succeeded,
    Failed(String),
}

/// Interpret `history[prompt_id].status`.
pub fn history_state(history: &serde_json::Value, prompt_id: &str) -> HistoryState {
    let Some(entry) = history.get(prompt_id) else {
        return HistoryState::Pending;
    };
    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(|s| s.as_str());

    if status_str == Some("error") {
        let message = status
            .and_then(|s| s.get("messages"))
            .and_then(|m| m.as_array())
            .and_then(|msgs| {
                msgs.iter().find_map(|m| {
                    (m.get(0)?.as_str()? == "execution_error")
                        .then(|| m.get(1)?.get("exception_message")?.as_str().map(str::to_string))
                        .flatten()
                })
            })
            .unwrap_or_else(|| "Engine reported an execution error".to_string());
        return HistoryState::Failed(message);
    }

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(|c| c.as_bool())
        .unwrap_or(false);
    if completed || status_str == Some("success") {
        HistoryState::Succeeded
    } else {
        HistoryState::Pending
    }
}
