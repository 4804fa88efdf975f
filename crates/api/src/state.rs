use std::sync::Arc;

use kiln_comfyui::api::ComfyUIApi;
use kiln_core::content_policy::ContentPolicy;
use kiln_core::license::{LicenseSigner, UsageMeter};
use kiln_core::quota::{DailyUsageTracker, RateLimiter};
use kiln_core::session::SessionStore;
use kiln_events::JobEventHub;
use kiln_pipeline::assets::AssetResolver;
use kiln_pipeline::executor::JobExecutor;

use crate::config::ServerConfig;
use crate::engine::Scheduler;
use crate::history::HistoryLog;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything is behind an `Arc` or is already `Clone`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Job queue and the single worker that drains it.
    pub scheduler: Arc<Scheduler>,
    /// Per-job event channels (WebSocket subscribers).
    pub hub: Arc<JobEventHub>,
    /// Per-session reference, asset and output folders.
    pub store: Arc<SessionStore>,
    pub resolver: Arc<AssetResolver>,
    pub signer: Arc<LicenseSigner>,
    /// Remaining uses of metered license tokens.
    pub meter: Arc<UsageMeter>,
    /// Free-tier daily allowance per client address.
    pub daily: Arc<DailyUsageTracker>,
    /// Request ceiling per client address on `/api`.
    pub rate_limiter: Arc<RateLimiter>,
    pub history: Arc<HistoryLog>,
    pub content_policy: Arc<ContentPolicy>,
    /// Engine REST client, used for health reporting.
    pub engine: ComfyUIApi,
}

impl AppState {
    /// Wire the governors, history and scheduler around the given engine
    /// pieces. The scheduler worker is not started; spawn
    /// [`Scheduler::run`] separately.
    pub async fn new(
        config: ServerConfig,
        engine: ComfyUIApi,
        store: Arc<SessionStore>,
        resolver: Arc<AssetResolver>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let meter = Arc::new(UsageMeter::new());
        let daily = Arc::new(DailyUsageTracker::new(config.free_daily_limit));
        let hub = Arc::new(JobEventHub::default());
        let history = Arc::new(HistoryLog::open(config.history_path()).await);
        let scheduler = Arc::new(Scheduler::new(
            config.max_queue_size,
            Arc::clone(&meter),
            Arc::clone(&daily),
            Arc::clone(&hub),
            Arc::clone(&history),
            executor,
        ));

        Self {
            scheduler,
            hub,
            store,
            resolver,
            signer: Arc::new(LicenseSigner::new(config.pro_secret.as_bytes().to_vec())),
            meter,
            daily,
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
            history,
            content_policy: Arc::new(ContentPolicy::standard()),
            engine,
            config: Arc::new(config),
        }
    }
}
