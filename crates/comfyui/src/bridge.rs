//! Drive one computation graph through the engine.
//!
//! [`EngineBridge::execute`] opens the push channel, submits the graph
//! under the channel's client id and waits for completion. Two producers
//! race for the completion signal: the push channel and a history poll
//! that covers a dropped socket. Whichever reports first wins; the other
//! is dropped. No completion within the timeout is a failure.
//!
//! [`EngineBridge::collect_outputs`] then copies the rendered images out
//! of the engine into a caller-owned directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::SinkExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{history_state, output_images, ComfyUIApi, ComfyUIApiError, HistoryState};
use crate::backoff::{connect_with_retry, BackoffConfig};
use crate::client::{ComfyUIClient, ComfyUIClientError};
use crate::events::EngineEvent;
use crate::processor::{await_completion, ProcessorError};

/// Upper bound on a single execution.
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(600);

/// Spacing of the history fallback poll.
pub const HISTORY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Prefix of saved artifact names.
pub const OUTPUT_PREFIX: &str = "kiln_";

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub completion_timeout: Duration,
    pub history_poll_interval: Duration,
    pub connect_backoff: BackoffConfig,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            completion_timeout: COMPLETION_TIMEOUT,
            history_poll_interval: HISTORY_POLL_INTERVAL,
            connect_backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Connect(#[from] ComfyUIClientError),

    /// `POST /prompt` refused the graph (validation error, missing model).
    #[error("Engine rejected the graph: {0}")]
    Submit(ComfyUIApiError),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// The history store reported the prompt as failed.
    #[error("Engine reported failure: {0}")]
    Failed(String),

    #[error("No completion signal from the engine within {0:?}")]
    TimedOut(Duration),

    #[error("Engine produced no images")]
    NoOutputs,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An artifact copied out of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
}

pub struct EngineBridge {
    api: ComfyUIApi,
    client: ComfyUIClient,
    settings: BridgeSettings,
}

impl EngineBridge {
    pub fn new(api: ComfyUIApi, client: ComfyUIClient) -> Self {
        Self {
            api,
            client,
            settings: BridgeSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Submit `graph` and wait for it to finish. Returns the prompt id.
    ///
    /// Progress and preview frames are forwarded on `events` as they
    /// arrive. `cancel` only aborts connection retries; once submitted,
    /// the engine run is left to finish.
    pub async fn execute(
        &self,
        graph: &serde_json::Value,
        events: &mpsc::UnboundedSender<EngineEvent>,
        cancel: &CancellationToken,
    ) -> Result<String, BridgeError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let mut conn =
            connect_with_retry(&self.client, &client_id, &self.settings.connect_backoff, cancel)
                .await?;

        let submitted = self
            .api
            .submit_workflow(graph, &conn.client_id)
            .await
            .map_err(BridgeError::Submit)?;
        let prompt_id = submitted.prompt_id;
        tracing::info!(prompt_id = %prompt_id, client_id = %conn.client_id, "Graph submitted to ComfyUI");

        let timeout = self.settings.completion_timeout;
        let outcome = tokio::time::timeout(timeout, async {
            let push = async {
                match await_completion(&mut conn.ws_stream, &prompt_id, events).await {
                    Err(ProcessorError::Disconnected | ProcessorError::Receive(_)) => {
                        tracing::warn!(
                            prompt_id = %prompt_id,
                            "Push channel lost, relying on history polling",
                        );
                        std::future::pending::<Result<(), BridgeError>>().await
                    }
                    other => other.map_err(BridgeError::from),
                }
            };
            tokio::select! {
                r = push => r,
                r = self.poll_history(&prompt_id) => r,
            }
        })
        .await;

        let _ = conn.ws_stream.close(None).await;

        match outcome {
            Ok(Ok(())) => Ok(prompt_id),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::error!(prompt_id = %prompt_id, ?timeout, "Execution timed out");
                Err(BridgeError::TimedOut(timeout))
            }
        }
    }

    /// Resolve once the history store shows `prompt_id` as finished.
    ///
    /// Request failures are logged and retried on the next tick.
    async fn poll_history(&self, prompt_id: &str) -> Result<(), BridgeError> {
        let mut interval = tokio::time::interval(self.settings.history_poll_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            match self.api.get_history(prompt_id).await {
                Ok(history) => match history_state(&history, prompt_id) {
                    HistoryState::Succeeded => {
                        tracing::debug!(prompt_id, "Completion observed via history");
                        return Ok(());
                    }
                    HistoryState::Failed(message) => return Err(BridgeError::Failed(message)),
                    HistoryState::Pending => {}
                },
                Err(e) => {
                    tracing::debug!(prompt_id, error = %e, "History poll failed");
                }
            }
        }
    }

    /// Copy every output image of `prompt_id` into `dest_dir`.
    ///
    /// Files are renamed to `kiln_<6 digits>.png`; engine-side names never
    /// reach the local filesystem.
    pub async fn collect_outputs(
        &self,
        prompt_id: &str,
        dest_dir: &Path,
    ) -> Result<Vec<OutputFile>, BridgeError> {
        let history = self.api.get_history(prompt_id).await?;
        let images = output_images(&history, prompt_id);
        if images.is_empty() {
            return Err(BridgeError::NoOutputs);
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let mut saved = Vec::with_capacity(images.len());
        for image in &images {
            let filename = unused_output_name(dest_dir).await;
            let path = dest_dir.join(&filename);
            let bytes = self.api.download_output(image, &path).await?;
            tracing::debug!(prompt_id, source = %image.filename, saved_as = %filename, bytes, "Saved output");
            saved.push(OutputFile {
                filename,
                path,
                bytes,
            });
        }
        Ok(saved)
    }
}

async fn unused_output_name(dir: &Path) -> String {
    loop {
        let n: u32 = rand::rng().random_range(100_000..1_000_000);
        let name = format!("{OUTPUT_PREFIX}{n}.png");
        if !tokio::fs::try_exists(dir.join(&name)).await.unwrap_or(false) {
            return name;
        }
    }
}
