//! Weight assets: where they come from and how the engine gets to see them.
//!
//! Lookup order for a named asset is the engine's advertised list, then
//! the shared folder, then the session's private folder. Anything else
//! with a URL is downloaded into the session folder. Session files are
//! published into the shared folder by link before use.

pub mod download;
pub mod progress;
pub mod publish;
pub mod resolver;

use kiln_comfyui::api::ComfyUIApiError;

pub use resolver::{AssetResolver, AssetResolverConfig, ResolvedAsset};

/// File extensions recognised as weight assets.
pub const ASSET_EXTENSIONS: &[&str] = &["safetensors", "bin", "pt", "ckpt"];

/// Extension appended to downloads that lack a recognised one.
pub const DEFAULT_ASSET_EXTENSION: &str = "safetensors";

pub fn has_asset_extension(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(_, ext)| {
        ASSET_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known))
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Only HTTP/HTTPS URLs are allowed")]
    UnsupportedScheme,

    #[error("Access to internal/private networks is blocked ({0})")]
    BlockedHost(String),

    #[error("URL exceeds maximum length ({0} characters)")]
    UrlTooLong(usize),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Asset exceeds the {limit}-byte size limit")]
    TooLarge { limit: u64 },

    #[error("Downloaded file is too small to be a model ({bytes} bytes)")]
    TooSmall { bytes: u64 },

    /// The server returned a web page instead of a binary payload.
    #[error("The URL returned an HTML page instead of a model file")]
    MarkupPayload,

    #[error("Download failed with HTTP status {0}")]
    HttpStatus(u16),

    #[error("Download request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Asset not found: {0}")]
    NotFound(String),

    /// The asset could not be linked into the shared folder.
    #[error("Could not publish asset {0} to the engine")]
    PublishFailed(String),

    #[error("Engine asset catalog unavailable: {0}")]
    Catalog(#[from] ComfyUIApiError),

    /// Published assets could not be confirmed because the catalog never
    /// answered.
    #[error("Engine never confirmed published assets: {0}")]
    VisibilityFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AssetError {
    /// Caused by what the client sent rather than by the server side.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AssetError::InvalidUrl(_)
                | AssetError::UnsupportedScheme
                | AssetError::BlockedHost(_)
                | AssetError::UrlTooLong(_)
                | AssetError::InvalidFilename(_)
                | AssetError::TooLarge { .. }
                | AssetError::TooSmall { .. }
                | AssetError::MarkupPayload
                | AssetError::HttpStatus(_)
                | AssetError::NotFound(_)
        )
    }
}
