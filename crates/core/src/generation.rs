//! Generation request parameters and their numeric bounds.
//!
//! Clients may send anything; every numeric field is clamped again when the
//! computation graph is built, so the accessors here always return values
//! inside the documented ranges.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::session::validate_filename;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

pub const MAX_REFERENCE_IMAGES: usize = 10;

pub const MIN_DIMENSION: u32 = 512;
pub const MAX_DIMENSION: u32 = 2048;
pub const DEFAULT_DIMENSION: u32 = 1024;

pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 13;
pub const DEFAULT_STEPS: u32 = 4;

pub const DEFAULT_NEGATIVE_PROMPT: &str = "bad quality, blurry";

/// Random seeds are drawn from `0..MAX_SEED`.
pub const MAX_SEED: u64 = 1_000_000_000_000;

pub const MIN_ASSET_STRENGTH: f64 = -10.0;
pub const MAX_ASSET_STRENGTH: f64 = 10.0;
pub const DEFAULT_ASSET_STRENGTH: f64 = 1.0;

/// Clamp `value` into `[min, max]`; NaN reads as zero before clamping.
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    let v = if value.is_nan() { 0.0 } else { value };
    v.max(min).min(max)
}

fn clamp_u32(value: Option<f64>, default: u32, min: u32, max: u32) -> u32 {
    match value {
        Some(v) if v.is_finite() => clamp(v.round(), f64::from(min), f64::from(max)) as u32,
        _ => default,
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A generation request as received from a client.
///
/// Immutable once a job is queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, alias = "negative_prompt")]
    pub negative: Option<String>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub steps: Option<f64>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Base model file. Defaults to the stock model.
    #[serde(default)]
    pub unet_name: Option<String>,
    /// Weight assets, applied in order.
    #[serde(default, alias = "loras")]
    pub assets: Vec<AssetSpec>,
    /// Filenames inside the session's reference namespace, in order.
    #[serde(default)]
    pub reference_images: Vec<String>,
    #[serde(default)]
    pub post_processing: Option<PostProcess>,
}

impl GenerationRequest {
    /// Structural checks that do not depend on server state.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation("Missing prompt".into()));
        }
        if self.reference_images.len() > MAX_REFERENCE_IMAGES {
            return Err(CoreError::Validation(format!(
                "Too many reference images: {} (max {MAX_REFERENCE_IMAGES})",
                self.reference_images.len()
            )));
        }
        for name in &self.reference_images {
            validate_filename(name)?;
        }
        for asset in &self.assets {
            asset.validate()?;
        }
        Ok(())
    }

    pub fn negative_prompt(&self) -> &str {
        match self.negative.as_deref() {
            Some(n) if !n.trim().is_empty() => n,
            _ => DEFAULT_NEGATIVE_PROMPT,
        }
    }

    pub fn width(&self) -> u32 {
        clamp_u32(self.width, DEFAULT_DIMENSION, MIN_DIMENSION, MAX_DIMENSION)
    }

    pub fn height(&self) -> u32 {
        clamp_u32(self.height, DEFAULT_DIMENSION, MIN_DIMENSION, MAX_DIMENSION)
    }

    pub fn steps(&self) -> u32 {
        clamp_u32(self.steps, DEFAULT_STEPS, MIN_STEPS, MAX_STEPS)
    }
}

/// One weight asset: a known filename, a URL, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub strength: Option<f64>,
    #[serde(default)]
    pub strength_model: Option<f64>,
    #[serde(default)]
    pub strength_clip: Option<f64>,
}

impl AssetSpec {
    pub fn requested_filename(&self) -> Option<&str> {
        self.filename
            .as_deref()
            .or(self.name.as_deref())
            .filter(|n| !n.is_empty())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.requested_filename().is_none() && self.url.is_none() {
            return Err(CoreError::Validation(
                "Asset needs a filename or a URL".into(),
            ));
        }
        Ok(())
    }

    pub fn model_strength(&self) -> f64 {
        Self::strength_or(self.strength_model.or(self.strength))
    }

    pub fn clip_strength(&self) -> f64 {
        Self::strength_or(self.strength_clip.or(self.strength))
    }

    fn strength_or(value: Option<f64>) -> f64 {
        clamp(
            value.unwrap_or(DEFAULT_ASSET_STRENGTH),
            MIN_ASSET_STRENGTH,
            MAX_ASSET_STRENGTH,
        )
    }
}

/// Post-process parameters. Unset fields take the engine-neutral default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcess {
    pub exposure: Option<f64>,
    pub contrast: Option<f64>,
    pub saturation: Option<f64>,
    pub vibrance: Option<f64>,
    pub temp: Option<f64>,
    pub tint: Option<f64>,
    pub sharpness: Option<f64>,
    pub vignette: Option<f64>,
    pub grain_amount: Option<f64>,
    pub grain_size: Option<f64>,
    pub glow_small_intensity: Option<f64>,
    pub glow_small_radius: Option<f64>,
    pub glow_small_threshold: Option<f64>,
    pub glow_large_intensity: Option<f64>,
    pub glow_large_radius: Option<f64>,
    pub glow_large_threshold: Option<f64>,
    pub glare_type: Option<String>,
    pub glare_intensity: Option<f64>,
    pub glare_length: Option<f64>,
    pub glare_angle: Option<f64>,
    pub glare_threshold: Option<f64>,
    pub ca_strength: Option<f64>,
    pub radial_blur_type: Option<String>,
    pub radial_blur_strength: Option<f64>,
    pub lens_distortion: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    #[test]
    fn numeric_fields_are_clamped_and_defaulted() {
        let mut req = request("fox");
        assert_eq!((req.width(), req.height(), req.steps()), (1024, 1024, 4));

        req.width = Some(99_999.0);
        req.height = Some(-3.0);
        req.steps = Some(500.0);
        assert_eq!((req.width(), req.height(), req.steps()), (2048, 512, 13));

        req.width = Some(f64::NAN);
        assert_eq!(req.width(), DEFAULT_DIMENSION);
    }

    #[test]
    fn blank_negative_uses_default() {
        let mut req = request("fox");
        req.negative = Some("   ".into());
        assert_eq!(req.negative_prompt(), DEFAULT_NEGATIVE_PROMPT);
    }

    #[test]
    fn eleventh_reference_image_is_rejected() {
        let mut req = request("fox");
        req.reference_images = (0..11).map(|i| format!("ref{i}.png")).collect();
        let err = req.validate().unwrap_err();
        assert_matches!(&err, CoreError::Validation(msg) if msg.contains("11") && msg.contains("10"));

        req.reference_images.pop();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn reference_names_must_be_plain_filenames() {
        let mut req = request("fox");
        req.reference_images = vec!["../../etc/passwd".into()];
        assert!(req.validate().is_err());
    }

    #[test]
    fn missing_prompt_is_rejected() {
        assert!(request("  ").validate().is_err());
    }

    #[test]
    fn asset_strengths_fall_back_and_clamp() {
        let spec = AssetSpec {
            name: Some("style.safetensors".into()),
            strength: Some(0.6),
            strength_clip: Some(40.0),
            ..Default::default()
        };
        assert_eq!(spec.model_strength(), 0.6);
        assert_eq!(spec.clip_strength(), MAX_ASSET_STRENGTH);
        assert_eq!(AssetSpec::default().model_strength(), 1.0);
    }

    #[test]
    fn asset_without_name_or_url_is_invalid() {
        assert!(AssetSpec::default().validate().is_err());
        let by_url = AssetSpec {
            url: Some("https://example.com/a.safetensors".into()),
            ..Default::default()
        };
        assert!(by_url.validate().is_ok());
    }

    #[test]
    fn accepts_legacy_field_names() {
        let req: GenerationRequest = serde_json::from_value(serde_json::json!({
            "prompt": "fox",
            "negative_prompt": "ugly",
            "loras": [{ "filename": "a.safetensors", "strength_model": 0.5 }]
        }))
        .unwrap();
        assert_eq!(req.negative_prompt(), "ugly");
        assert_eq!(req.assets.len(), 1);
        assert_eq!(req.assets[0].model_strength(), 0.5);
    }
}
