use std::path::PathBuf;

use kiln_core::queue::DEFAULT_MAX_QUEUE_SIZE;
use kiln_core::quota::{DEFAULT_RATE_LIMIT, FREE_DAILY_LIMIT};
use kiln_core::license::DEFAULT_METERED_LIMIT;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development. In
/// production, override the secrets and keys via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3088`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// Timeout for non-streaming requests in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Engine `host:port`; HTTP and WebSocket URLs are derived from it.
    pub comfy_host: String,
    /// Root for outputs, session namespaces, upload scratch and history.
    pub data_dir: PathBuf,
    /// Folder the engine scans for weight assets.
    pub loras_root: PathBuf,
    /// HMAC key for license tokens.
    pub pro_secret: String,
    /// Activation key that mints an unlimited pro token.
    pub master_pro_key: String,
    /// Activation key that mints a metered pro token.
    pub limited_pro_key: String,
    pub limited_pro_limit: u32,
    /// Bearer credential for the `/api/v1` automation API.
    pub external_api_key: String,
    /// Appended to civitai.com download URLs when set.
    pub civitai_token: Option<String>,
    /// Reference assets by absolute path when linking fails.
    pub allow_absolute_asset_paths: bool,
    pub max_queue_size: usize,
    /// Free generations per client address per day.
    pub free_daily_limit: u32,
    /// Requests per client address per minute on `/api`.
    pub rate_limit_per_minute: u32,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                    |
    /// |------------------------------|----------------------------|
    /// | `HOST`                       | `0.0.0.0`                  |
    /// | `PORT`                       | `3088`                     |
    /// | `CORS_ORIGINS`               | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS`       | `30`                       |
    /// | `COMFY_HOST`                 | `127.0.0.1:8188`           |
    /// | `DATA_DIR`                   | `.`                        |
    /// | `LORAS_ROOT`                 | `<DATA_DIR>/USER_LORA`     |
    /// | `PRO_SECRET`                 | dev value                  |
    /// | `MASTER_PRO_KEY`             | dev value                  |
    /// | `LIMITED_PRO_KEY`            | dev value                  |
    /// | `LIMITED_PRO_LIMIT`          | `50`                       |
    /// | `EXTERNAL_API_KEY`           | dev value                  |
    /// | `CIVITAI_TOKEN`              | unset                      |
    /// | `ALLOW_ABSOLUTE_ASSET_PATHS` | `false`                    |
    /// | `MAX_QUEUE_SIZE`             | `500`                      |
    /// | `FREE_DAILY_LIMIT`           | `100`                      |
    /// | `RATE_LIMIT_PER_MINUTE`      | `60`                       |
    ///
    /// Panics on unparsable numbers so misconfiguration fails at startup.
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3088".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let comfy_host = std::env::var("COMFY_HOST").unwrap_or_else(|_| "127.0.0.1:8188".into());

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".".into()));
        let loras_root = std::env::var("LORAS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("USER_LORA"));

        let limited_pro_limit: u32 = std::env::var("LIMITED_PRO_LIMIT")
            .unwrap_or_else(|_| DEFAULT_METERED_LIMIT.to_string())
            .parse()
            .expect("LIMITED_PRO_LIMIT must be a valid u32");

        let allow_absolute_asset_paths = std::env::var("ALLOW_ABSOLUTE_ASSET_PATHS")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let max_queue_size: usize = std::env::var("MAX_QUEUE_SIZE")
            .unwrap_or_else(|_| DEFAULT_MAX_QUEUE_SIZE.to_string())
            .parse()
            .expect("MAX_QUEUE_SIZE must be a valid usize");

        let free_daily_limit: u32 = std::env::var("FREE_DAILY_LIMIT")
            .unwrap_or_else(|_| FREE_DAILY_LIMIT.to_string())
            .parse()
            .expect("FREE_DAILY_LIMIT must be a valid u32");

        let rate_limit_per_minute: u32 = std::env::var("RATE_LIMIT_PER_MINUTE")
            .unwrap_or_else(|_| DEFAULT_RATE_LIMIT.to_string())
            .parse()
            .expect("RATE_LIMIT_PER_MINUTE must be a valid u32");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            comfy_host,
            data_dir,
            loras_root,
            pro_secret: secret_var("PRO_SECRET", "kiln-pro-dev-secret"),
            master_pro_key: secret_var("MASTER_PRO_KEY", "kiln-master-dev"),
            limited_pro_key: secret_var("LIMITED_PRO_KEY", "kiln-limited-dev"),
            limited_pro_limit,
            external_api_key: secret_var("EXTERNAL_API_KEY", "kiln-external-dev"),
            civitai_token: std::env::var("CIVITAI_TOKEN")
                .ok()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            allow_absolute_asset_paths,
            max_queue_size,
            free_daily_limit,
            rate_limit_per_minute,
        }
    }

    pub fn comfy_http_url(&self) -> String {
        format!("http://{}", self.comfy_host)
    }

    pub fn comfy_ws_url(&self) -> String {
        format!("ws://{}", self.comfy_host)
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.data_dir.join("outputs")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Scratch space for multipart uploads before they are moved into place.
    pub fn uploads_tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp_uploads")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }
}

/// Read a secret, trimming stray whitespace and line endings from env files.
fn secret_var(name: &str, default: &str) -> String {
    let value = std::env::var(name).unwrap_or_else(|_| {
        tracing::warn!(var = name, "Not set, using development default");
        default.into()
    });
    value.trim().to_string()
}
