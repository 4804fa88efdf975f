//! Running one job end to end.
//!
//! The scheduler only sees [`JobExecutor`]; [`GenerationExecutor`] is the
//! production implementation that resolves assets, builds the graph, hands
//! it to the engine and copies the outputs back.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use kiln_comfyui::bridge::{BridgeError, EngineBridge};
use kiln_comfyui::events::EngineEvent;
use kiln_comfyui::messages::PreviewFormat;
use kiln_core::error::CoreError;
use kiln_core::generation::MAX_SEED;
use kiln_core::queue::{Artifact, FailureKind, Job};
use kiln_core::session::{SessionId, SessionStore};
use kiln_events::{JobEvent, JobEventPublisher};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::assets::{AssetError, AssetResolver};
use crate::workflow::{build_generation_graph, GraphError, WorkflowInputs};

// ---------------------------------------------------------------------------
// Seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub prompt_id: Option<String>,
    pub artifacts: Vec<Artifact>,
}

/// Why a job failed, tagged with the stage it failed in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<GraphError> for ExecutionError {
    fn from(e: GraphError) -> Self {
        Self::new(FailureKind::Graph, e.to_string())
    }
}

impl From<AssetError> for ExecutionError {
    fn from(e: AssetError) -> Self {
        Self::new(FailureKind::Asset, e.to_string())
    }
}

impl From<BridgeError> for ExecutionError {
    fn from(e: BridgeError) -> Self {
        let kind = match e {
            BridgeError::Io(_) => FailureKind::Internal,
            _ => FailureKind::Engine,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<CoreError> for ExecutionError {
    fn from(e: CoreError) -> Self {
        let kind = match e {
            CoreError::Internal(_) => FailureKind::Internal,
            _ => FailureKind::Graph,
        };
        Self::new(kind, e.to_string())
    }
}

/// Runs a job that the scheduler has just moved to `running`.
///
/// Implementations stream progress on `events`; the scheduler publishes
/// the lifecycle events itself.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        job: &Job,
        events: &JobEventPublisher,
    ) -> Result<ExecutionReport, ExecutionError>;
}

// ---------------------------------------------------------------------------
// GenerationExecutor
// ---------------------------------------------------------------------------

pub struct GenerationExecutor {
    resolver: Arc<AssetResolver>,
    bridge: EngineBridge,
    store: Arc<SessionStore>,
    shutdown: CancellationToken,
}

impl GenerationExecutor {
    pub fn new(
        resolver: Arc<AssetResolver>,
        bridge: EngineBridge,
        store: Arc<SessionStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            bridge,
            store,
            shutdown,
        }
    }

    async fn reference_paths(&self, job: &Job) -> Result<Vec<PathBuf>, ExecutionError> {
        let mut paths = Vec::with_capacity(job.parameters.reference_images.len());
        for name in &job.parameters.reference_images {
            let path = self.store.reference_path(&job.session_id, name).await?;
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(ExecutionError::new(
                    FailureKind::Graph,
                    format!("Reference image not found: {name}"),
                ));
            }
            paths.push(path);
        }
        Ok(paths)
    }
}

#[async_trait]
impl JobExecutor for GenerationExecutor {
    async fn execute(
        &self,
        job: &Job,
        events: &JobEventPublisher,
    ) -> Result<ExecutionReport, ExecutionError> {
        let request = job.parameters.as_ref();
        request.validate()?;

        let references = self.reference_paths(job).await?;
        let assets = self
            .resolver
            .resolve_chain(&job.session_id, &request.assets)
            .await?;
        let seed = request
            .seed
            .unwrap_or_else(|| rand::rng().random_range(0..MAX_SEED));

        let graph = build_generation_graph(&WorkflowInputs {
            request,
            seed,
            assets: &assets,
            reference_images: &references,
        })?;
        tracing::info!(
            job_id = %job.job_id,
            session_id = %job.session_id,
            nodes = graph.len(),
            assets = assets.len(),
            references = references.len(),
            seed,
            "Generation graph built",
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_engine_events(rx, events.clone()));
        let executed = self
            .bridge
            .execute(&graph.to_prompt_json(), &tx, &self.shutdown)
            .await;
        drop(tx);
        let _ = forwarder.await;
        let prompt_id = executed?;

        let dest = self
            .store
            .outputs_dir(&job.session_id)
            .await
            .map_err(|e| ExecutionError::new(FailureKind::Internal, e.to_string()))?;
        let outputs = self.bridge.collect_outputs(&prompt_id, &dest).await?;
        let artifacts = outputs
            .into_iter()
            .map(|out| Artifact {
                url: artifact_url(&job.session_id, &out.filename),
                filename: out.filename,
            })
            .collect();

        Ok(ExecutionReport {
            prompt_id: Some(prompt_id),
            artifacts,
        })
    }
}

/// Relay engine events to the job's subscribers until the sender drops.
async fn forward_engine_events(
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    events: JobEventPublisher,
) {
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::ExecutionStarted { prompt_id } => {
                tracing::debug!(job_id = events.job_id(), prompt_id = %prompt_id, "Engine started prompt");
            }
            EngineEvent::Progress { step, total } => {
                events.emit(JobEvent::Progress { step, total });
            }
            EngineEvent::Preview { format, data } => {
                events.emit(JobEvent::Preview {
                    image: preview_data_url(format, &data),
                });
            }
        }
    }
}

pub fn preview_data_url(format: PreviewFormat, data: &[u8]) -> String {
    format!("data:{};base64,{}", format.mime_type(), STANDARD.encode(data))
}

/// Owner-scoped URL an output is served under.
pub fn artifact_url(session: &SessionId, filename: &str) -> String {
    format!("/outputs/{session}/{filename}?session_id={session}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::download::{DownloadLimits, Downloader};
    use crate::assets::AssetResolverConfig;
    use crate::test_support::{FakeCatalog, FakeEngine, ENGINE_IMAGE, ENGINE_PROMPT_ID};
    use kiln_comfyui::api::ComfyUIApi;
    use kiln_comfyui::backoff::BackoffConfig;
    use kiln_comfyui::bridge::{BridgeSettings, OUTPUT_PREFIX};
    use kiln_comfyui::client::ComfyUIClient;
    use kiln_core::generation::{AssetSpec, GenerationRequest};
    use kiln_core::license::Plan;
    use kiln_events::JobEventHub;
    use serde_json::Value;
    use std::time::Duration;

    #[test]
    fn artifact_urls_are_owner_scoped() {
        let sid = SessionId::parse("sid_exec01").unwrap();
        assert_eq!(
            artifact_url(&sid, "kiln_123456.png"),
            "/outputs/sid_exec01/kiln_123456.png?session_id=sid_exec01"
        );
    }

    #[test]
    fn previews_become_data_urls() {
        assert_eq!(
            preview_data_url(PreviewFormat::Png, b"abc"),
            "data:image/png;base64,YWJj"
        );
        assert!(preview_data_url(PreviewFormat::Jpeg, b"").starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn failures_keep_their_stage() {
        assert_eq!(
            ExecutionError::from(GraphError::MissingPrompt).kind,
            FailureKind::Graph
        );
        assert_eq!(
            ExecutionError::from(AssetError::NotFound("x".into())).kind,
            FailureKind::Asset
        );
        let engine = ExecutionError::from(BridgeError::Failed("OOM".into()));
        assert_eq!(engine.kind, FailureKind::Engine);
        assert!(engine.message.contains("OOM"));
        assert_eq!(
            ExecutionError::from(BridgeError::Io(std::io::Error::other("disk"))).kind,
            FailureKind::Internal
        );
        assert_eq!(
            ExecutionError::from(CoreError::Validation("Missing prompt".into())).kind,
            FailureKind::Graph
        );
    }

    fn nodes_of<'a>(graph: &'a Value, class_type: &str) -> Vec<&'a Value> {
        graph
            .as_object()
            .unwrap()
            .values()
            .filter(|node| node["class_type"] == class_type)
            .collect()
    }

    // ---- Test: end to end ----

    #[tokio::test]
    async fn job_runs_through_the_engine_into_session_outputs() {
        let engine = FakeEngine::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let shared = tmp.path().join("USER_LORA");
        std::fs::create_dir_all(&shared).unwrap();
        let outputs_root = tmp.path().join("outputs");
        let store = Arc::new(SessionStore::new(tmp.path().join("sessions"), outputs_root.clone()));
        let catalog = Arc::new(FakeCatalog::with_assets(&["style.safetensors"]));
        let resolver = Arc::new(AssetResolver::new(
            catalog.clone(),
            Arc::clone(&store),
            Downloader::new(DownloadLimits::default()).unwrap(),
            AssetResolverConfig::new(&shared),
        ));
        let bridge = EngineBridge::new(
            ComfyUIApi::new(engine.api_url.clone()),
            ComfyUIClient::new(engine.ws_url.clone()),
        )
        .with_settings(BridgeSettings {
            completion_timeout: Duration::from_secs(5),
            history_poll_interval: Duration::from_millis(20),
            connect_backoff: BackoffConfig::fixed(Duration::from_millis(10), 3),
        });
        let executor =
            GenerationExecutor::new(resolver, bridge, Arc::clone(&store), CancellationToken::new());

        let session = SessionId::parse("sid_exec01").unwrap();
        let reference = store.reference_path(&session, "face.png").await.unwrap();
        tokio::fs::write(&reference, b"\x89PNGref").await.unwrap();

        let job = Job::new(
            "job-e2e".into(),
            session.clone(),
            "10.0.0.1",
            Plan::Free,
            GenerationRequest {
                prompt: "a lighthouse at dusk".into(),
                seed: Some(42),
                assets: vec![AssetSpec {
                    filename: Some("style.safetensors".into()),
                    strength: Some(0.8),
                    ..Default::default()
                }],
                reference_images: vec!["face.png".into()],
                ..Default::default()
            },
            chrono::Utc::now(),
        );
        let hub = Arc::new(JobEventHub::default());
        let report = executor.execute(&job, &hub.publisher("job-e2e")).await.unwrap();

        assert_eq!(report.prompt_id.as_deref(), Some(ENGINE_PROMPT_ID));
        assert_eq!(report.artifacts.len(), 1);
        let artifact = &report.artifacts[0];
        assert!(artifact.filename.starts_with(OUTPUT_PREFIX));
        assert!(artifact.filename.ends_with(".png"));
        assert_eq!(artifact.url, artifact_url(&session, &artifact.filename));
        let saved = outputs_root.join("sid_exec01").join(&artifact.filename);
        assert_eq!(std::fs::read(saved).unwrap(), ENGINE_IMAGE);

        let graph = engine.submitted_graph().expect("graph was submitted");
        let loras = nodes_of(&graph, "LoraLoader");
        assert_eq!(loras.len(), 1);
        assert_eq!(loras[0]["inputs"]["lora_name"], "style.safetensors");
        assert_eq!(loras[0]["inputs"]["strength_model"], 0.8);

        let loads = nodes_of(&graph, "LoadImage");
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0]["inputs"]["image"], reference.to_string_lossy().as_ref());
        assert_eq!(nodes_of(&graph, "ReferenceLatent").len(), 2);

        // The asset was already advertised, so nothing was rescanned.
        assert_eq!(catalog.refresh_count(), 0);
    }

    #[tokio::test]
    async fn engine_events_reach_job_subscribers() {
        let hub = Arc::new(JobEventHub::default());
        let mut rx = hub.subscribe("job-1");
        let (tx, engine_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_engine_events(engine_rx, hub.publisher("job-1")));

        tx.send(EngineEvent::ExecutionStarted {
            prompt_id: "p".into(),
        })
        .unwrap();
        tx.send(EngineEvent::Progress { step: 2, total: 4 }).unwrap();
        tx.send(EngineEvent::Preview {
            format: PreviewFormat::Jpeg,
            data: vec![1, 2, 3],
        })
        .unwrap();
        drop(tx);
        forwarder.await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), JobEvent::Progress { step: 2, total: 4 });
        assert_eq!(
            rx.recv().await.unwrap(),
            JobEvent::Preview {
                image: "data:image/jpeg;base64,AQID".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
