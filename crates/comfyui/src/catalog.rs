//! The engine's view of published weight assets.
//!
//! Asset publication only needs to list and refresh, so it depends on this
//! trait rather than on [`ComfyUIApi`] directly.

use async_trait::async_trait;

use crate::api::{ComfyUIApi, ComfyUIApiError};

#[async_trait]
pub trait AssetCatalog: Send + Sync {
    /// Asset names the engine currently accepts in a loader node.
    async fn advertised_assets(&self) -> Result<Vec<String>, ComfyUIApiError>;

    /// Ask the engine to rescan its asset folders.
    async fn refresh(&self) -> Result<(), ComfyUIApiError>;
}

#[async_trait]
impl AssetCatalog for ComfyUIApi {
    async fn advertised_assets(&self) -> Result<Vec<String>, ComfyUIApiError> {
        self.list_assets().await
    }

    async fn refresh(&self) -> Result<(), ComfyUIApiError> {
        self.refresh_models().await
    }
}
