#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use kiln_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use kiln_comfyui::catalog::AssetCatalog;
use kiln_core::queue::{Artifact, Job};
use kiln_core::session::SessionStore;
use kiln_events::JobEventPublisher;
use kiln_pipeline::assets::download::{DownloadLimits, Downloader};
use kiln_pipeline::assets::{AssetResolver, AssetResolverConfig};
use kiln_pipeline::executor::{artifact_url, ExecutionReport, ExecutionError, JobExecutor};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use kiln_api::config::ServerConfig;
use kiln_api::router::build_app_router;
use kiln_api::state::AppState;

pub const MASTER_KEY: &str = "Master-Key-1";
pub const LIMITED_KEY: &str = "Limited-Key-1";
pub const LIMITED_LIMIT: u32 = 3;
pub const EXTERNAL_KEY: &str = "external-test-key";

/// Build a test `ServerConfig` rooted at `data_dir`.
///
/// Points the engine at a closed port so health checks fail fast, and
/// sets the rate limit high enough that ordinary tests never hit it.
pub fn test_config(data_dir: &std::path::Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        comfy_host: "127.0.0.1:1".to_string(),
        data_dir: data_dir.to_path_buf(),
        loras_root: data_dir.join("USER_LORA"),
        pro_secret: "test-secret".to_string(),
        master_pro_key: MASTER_KEY.to_string(),
        limited_pro_key: LIMITED_KEY.to_string(),
        limited_pro_limit: LIMITED_LIMIT,
        external_api_key: EXTERNAL_KEY.to_string(),
        civitai_token: None,
        allow_absolute_asset_paths: false,
        max_queue_size: 500,
        free_daily_limit: 100,
        rate_limit_per_minute: 10_000,
    }
}

/// Executor that "renders" one artifact immediately.
pub struct InstantExecutor;

#[async_trait]
impl JobExecutor for InstantExecutor {
    async fn execute(
        &self,
        job: &Job,
        _events: &JobEventPublisher,
    ) -> Result<ExecutionReport, ExecutionError> {
        let filename = "kiln_000001.png";
        Ok(ExecutionReport {
            prompt_id: Some(format!("prompt-{}", job.job_id)),
            artifacts: vec![Artifact {
                url: artifact_url(&job.session_id, filename),
                filename: filename.to_string(),
            }],
        })
    }
}

/// Catalog with nothing advertised.
pub struct EmptyCatalog;

#[async_trait]
impl AssetCatalog for EmptyCatalog {
    async fn advertised_assets(&self) -> Result<Vec<String>, ComfyUIApiError> {
        Ok(Vec::new())
    }

    async fn refresh(&self) -> Result<(), ComfyUIApiError> {
        Ok(())
    }
}

/// A running test application. Dropping it removes its data directory.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub data: TempDir,
}

impl TestApp {
    pub fn app(&self) -> Router {
        self.router.clone()
    }

    /// Start the scheduler worker. It stops when the token is cancelled.
    pub fn start_worker(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&self.state.scheduler).run(cancel.clone()));
        cancel
    }
}

pub async fn build_test_app() -> TestApp {
    build_test_app_with(|_| {}).await
}

/// Build the full application router over a fresh data directory.
///
/// The scheduler worker is not started, so submitted jobs stay queued
/// until [`TestApp::start_worker`] is called.
pub async fn build_test_app_with(customize: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let data = tempfile::tempdir().unwrap();
    let mut config = test_config(data.path());
    customize(&mut config);
    std::fs::create_dir_all(&config.loras_root).unwrap();

    let store = Arc::new(SessionStore::new(config.sessions_dir(), config.outputs_dir()));
    let resolver = Arc::new(AssetResolver::new(
        Arc::new(EmptyCatalog),
        Arc::clone(&store),
        Downloader::new(DownloadLimits::default()).unwrap(),
        AssetResolverConfig::new(config.loras_root.clone()),
    ));
    let engine = ComfyUIApi::new(config.comfy_http_url());

    let state = AppState::new(
        config.clone(),
        engine,
        store,
        resolver,
        Arc::new(InstantExecutor),
    )
    .await;
    let router = build_app_router(state.clone(), &config);

    TestApp {
        router,
        state,
        data,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

pub async fn get_auth(app: Router, uri: &str, token: &str) -> Response<Body> {
    let request = Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn delete(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    send(app, json_request(uri, body, None)).await
}

pub async fn post_json_auth(
    app: Router,
    uri: &str,
    body: serde_json::Value,
    token: &str,
) -> Response<Body> {
    send(app, json_request(uri, body, Some(token))).await
}

fn json_request(uri: &str, body: serde_json::Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

const BOUNDARY: &str = "kiln-test-boundary";

/// A multipart upload with an optional `session_id` part and one `file` part.
pub fn multipart_request(
    uri: &str,
    session_id: Option<&str>,
    filename: &str,
    contents: &[u8],
    token: Option<&str>,
) -> Request<Body> {
    let mut body = Vec::new();
    if let Some(sid) = session_id {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"session_id\"\r\n\r\n{sid}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body)).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

/// Poll `check` until it returns `Some`, for at most five seconds.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within five seconds"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A generation body with just a prompt.
pub fn generate_body(session_id: &str, prompt: &str) -> serde_json::Value {
    serde_json::json!({ "session_id": session_id, "prompt": prompt })
}
