use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kiln_comfyui::api::ComfyUIApi;
use kiln_comfyui::bridge::EngineBridge;
use kiln_comfyui::catalog::AssetCatalog;
use kiln_comfyui::client::ComfyUIClient;
use kiln_core::session::SessionStore;
use kiln_pipeline::assets::download::{DownloadLimits, Downloader};
use kiln_pipeline::assets::{AssetResolver, AssetResolverConfig};
use kiln_pipeline::executor::GenerationExecutor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_api::background;
use kiln_api::config::ServerConfig;
use kiln_api::router::build_app_router;
use kiln_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kiln_api=debug,kiln_pipeline=debug,kiln_comfyui=info,tower_http=debug".into()
            }),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = %config.port,
        comfy_host = %config.comfy_host,
        data_dir = %config.data_dir.display(),
        "Loaded server configuration"
    );

    for dir in [
        config.outputs_dir(),
        config.sessions_dir(),
        config.uploads_tmp_dir(),
        config.loras_root.clone(),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .unwrap_or_else(|e| panic!("Failed to create {}: {e}", dir.display()));
    }

    // --- Engine ---
    let engine = ComfyUIApi::new(config.comfy_http_url());
    let bridge = EngineBridge::new(engine.clone(), ComfyUIClient::new(config.comfy_ws_url()));
    match engine.system_stats().await {
        Ok(_) => tracing::info!("Engine reachable"),
        Err(e) => tracing::warn!(error = %e, "Engine not reachable yet, jobs will fail until it is"),
    }

    // --- Storage and asset resolution ---
    let store = Arc::new(SessionStore::new(config.sessions_dir(), config.outputs_dir()));
    let mut resolver_config = AssetResolverConfig::new(config.loras_root.clone());
    resolver_config.allow_absolute_paths = config.allow_absolute_asset_paths;
    resolver_config.civitai_token = config.civitai_token.clone();
    let catalog: Arc<dyn AssetCatalog> = Arc::new(engine.clone());
    let downloader =
        Downloader::new(DownloadLimits::default()).expect("Failed to build download client");
    let resolver = Arc::new(AssetResolver::new(
        catalog,
        Arc::clone(&store),
        downloader,
        resolver_config,
    ));

    // --- Scheduler ---
    let shutdown = CancellationToken::new();
    let executor = Arc::new(GenerationExecutor::new(
        Arc::clone(&resolver),
        bridge,
        Arc::clone(&store),
        shutdown.clone(),
    ));

    // --- App state ---
    let state = AppState::new(config.clone(), engine, store, resolver, executor).await;
    tracing::info!(
        history_entries = state.history.len().await,
        "Application state assembled"
    );

    let scheduler_handle = tokio::spawn(Arc::clone(&state.scheduler).run(shutdown.clone()));

    // --- Background tasks ---
    let reaper_handle = tokio::spawn(background::session_reaper::run(
        config.sessions_dir(),
        config.loras_root.clone(),
        shutdown.clone(),
    ));
    let sweep_handle = tokio::spawn(background::usage_sweep::run(
        Arc::clone(&state.daily),
        Arc::clone(&state.rate_limiter),
        Arc::clone(state.resolver.progress()),
        shutdown.clone(),
    ));
    tracing::info!("Background tasks started (scheduler, session reaper, usage sweep)");

    // --- Router ---
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Stops the worker loop and aborts any in-flight engine wait.
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), scheduler_handle).await;
    tracing::info!("Scheduler stopped");

    let _ = tokio::time::timeout(Duration::from_secs(5), reaper_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), sweep_handle).await;
    tracing::info!("Background tasks stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
