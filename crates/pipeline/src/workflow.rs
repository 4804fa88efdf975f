//! Layout of the image generation graph.
//!
//! Node order:
//!
//! ```text
//! model / clip / vae loaders
//! empty latent, noise, sampler select, scheduler
//! LoraLoader x N            (model + clip chained through each asset)
//! positive / negative text encodes (from the final clip)
//! per reference image: load -> scale -> encode -> ReferenceLatent (pos, neg)
//! CFGGuider -> SamplerCustomAdvanced -> VAEDecode
//! post-process suite        (only when requested)
//! SaveImage
//! ```

use std::path::PathBuf;

use kiln_core::generation::{clamp, GenerationRequest, PostProcess, MAX_REFERENCE_IMAGES};
use kiln_core::session::is_valid_filename;

use crate::assets::ResolvedAsset;
use crate::graph::{ComputationGraph, GraphBuilder, NodeSpec, Output};

pub const DEFAULT_UNET: &str = "flux-2-klein-9b-Q6_K.gguf";
const LEGACY_UNET_NAMES: &[&str] = &["flux-2-klein-9b-q8_0.gguf", "flux-2-klein-9b-q6_k.gguf"];

pub const CLIP_NAME: &str = "qwen_3_8b_fp8mixed.safetensors";
pub const CLIP_TYPE: &str = "flux2";
pub const VAE_NAME: &str = "flux2-vae.safetensors";
pub const SAMPLER_NAME: &str = "euler";
pub const CFG: f64 = 1.0;
pub const SAVE_PREFIX: &str = "kiln";

pub const POST_PROCESS_NODE: &str = "CRT Post-Process Suite";
pub const GLARE_TYPES: &[&str] = &["star_4", "star_6", "star_8", "anamorphic_h"];
pub const RADIAL_BLUR_TYPES: &[&str] = &["none", "spin", "zoom"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Missing prompt")]
    MissingPrompt,

    #[error("Too many reference images: {count} (max {max})")]
    TooManyReferences { count: usize, max: usize },

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Everything the layout needs, already resolved.
pub struct WorkflowInputs<'a> {
    pub request: &'a GenerationRequest,
    pub seed: u64,
    pub assets: &'a [ResolvedAsset],
    /// Absolute paths of the reference images, in request order.
    pub reference_images: &'a [PathBuf],
}

/// Model file to load, with retired quantisation names mapped to the
/// current one.
pub fn unet_name(requested: Option<&str>) -> Result<String, GraphError> {
    let Some(name) = requested.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(DEFAULT_UNET.to_string());
    };
    if LEGACY_UNET_NAMES
        .iter()
        .any(|legacy| name.eq_ignore_ascii_case(legacy))
    {
        return Ok(DEFAULT_UNET.to_string());
    }
    if !is_valid_filename(name) {
        return Err(GraphError::InvalidModel(name.to_string()));
    }
    Ok(name.to_string())
}

pub fn build_generation_graph(inputs: &WorkflowInputs<'_>) -> Result<ComputationGraph, GraphError> {
    let req = inputs.request;
    if req.prompt.trim().is_empty() {
        return Err(GraphError::MissingPrompt);
    }
    if inputs.reference_images.len() > MAX_REFERENCE_IMAGES {
        return Err(GraphError::TooManyReferences {
            count: inputs.reference_images.len(),
            max: MAX_REFERENCE_IMAGES,
        });
    }
    let unet = unet_name(req.unet_name.as_deref())?;
    let (width, height, steps) = (req.width(), req.height(), req.steps());

    let mut g = GraphBuilder::new();

    let model_loader = g.add(NodeSpec::new("LoaderGGUF").input("gguf_name", unet));
    let clip_loader = g.add(
        NodeSpec::new("ClipLoaderGGUF")
            .input("clip_name", CLIP_NAME)
            .input("type", CLIP_TYPE),
    );
    let vae = g.add(NodeSpec::new("VAELoader").input("vae_name", VAE_NAME));
    let latent = g.add(
        NodeSpec::new("EmptyFlux2LatentImage")
            .input("width", width)
            .input("height", height)
            .input("batch_size", 1u32),
    );
    let noise = g.add(NodeSpec::new("RandomNoise").input("noise_seed", inputs.seed));
    let sampler = g.add(NodeSpec::new("KSamplerSelect").input("sampler_name", SAMPLER_NAME));
    let sigmas = g.add(
        NodeSpec::new("Flux2Scheduler")
            .input("steps", steps)
            .input("width", width)
            .input("height", height),
    );

    let mut model: Output = model_loader.output(0);
    let mut clip: Output = clip_loader.output(0);
    for asset in inputs.assets {
        let lora = g.add(
            NodeSpec::new("LoraLoader")
                .input("lora_name", asset.workflow_name.as_str())
                .input("strength_model", asset.strength_model)
                .input("strength_clip", asset.strength_clip)
                .input("model", model)
                .input("clip", clip),
        );
        model = lora.output(0);
        clip = lora.output(1);
    }

    let mut positive = g
        .add(
            NodeSpec::new("CLIPTextEncode")
                .input("text", req.prompt.as_str())
                .input("clip", clip),
        )
        .output(0);
    let mut negative = g
        .add(
            NodeSpec::new("CLIPTextEncode")
                .input("text", req.negative_prompt())
                .input("clip", clip),
        )
        .output(0);

    for image in inputs.reference_images {
        let load = g.add(NodeSpec::new("LoadImage").input("image", image.to_string_lossy().into_owned()));
        let scaled = g.add(
            NodeSpec::new("ImageScaleToTotalPixels")
                .input("image", load.output(0))
                .input("upscale_method", "nearest-exact")
                .input("megapixels", 1u32)
                .input("resolution_steps", 8u32),
        );
        let encoded = g.add(
            NodeSpec::new("VAEEncode")
                .input("pixels", scaled.output(0))
                .input("vae", vae.output(0)),
        );
        positive = g
            .add(
                NodeSpec::new("ReferenceLatent")
                    .input("conditioning", positive)
                    .input("latent", encoded.output(0)),
            )
            .output(0);
        negative = g
            .add(
                NodeSpec::new("ReferenceLatent")
                    .input("conditioning", negative)
                    .input("latent", encoded.output(0)),
            )
            .output(0);
    }

    let guider = g.add(
        NodeSpec::new("CFGGuider")
            .input("cfg", CFG)
            .input("model", model)
            .input("positive", positive)
            .input("negative", negative),
    );
    let sampled = g.add(
        NodeSpec::new("SamplerCustomAdvanced")
            .input("noise", noise.output(0))
            .input("guider", guider.output(0))
            .input("sampler", sampler.output(0))
            .input("sigmas", sigmas.output(0))
            .input("latent_image", latent.output(0)),
    );
    let mut image = g
        .add(
            NodeSpec::new("VAEDecode")
                .input("samples", sampled.output(0))
                .input("vae", vae.output(0)),
        )
        .output(0);

    if let Some(pp) = &req.post_processing {
        image = g.add(post_process_node(image, pp)).output(0);
    }

    g.add(
        NodeSpec::new("SaveImage")
            .input("filename_prefix", SAVE_PREFIX)
            .input("images", image),
    );
    Ok(g.build())
}

fn known_or(value: Option<&str>, known: &[&str], default: &'static str) -> String {
    value
        .filter(|v| known.contains(v))
        .unwrap_or(default)
        .to_string()
}

/// The post-process suite with every field clamped to its range.
fn post_process_node(image: Output, pp: &PostProcess) -> NodeSpec {
    let c = |v: Option<f64>, min: f64, max: f64| clamp(v.unwrap_or(0.0), min, max);

    let exposure = c(pp.exposure, -0.5, 0.5);
    let contrast = clamp(pp.contrast.unwrap_or(1.0), 0.5, 2.0);
    let saturation = clamp(pp.saturation.unwrap_or(1.0), 0.0, 2.0);
    let vibrance = c(pp.vibrance, -0.5, 0.5);
    let temperature = c(pp.temp, -0.5, 0.5);
    let tint = c(pp.tint, -0.5, 0.5);
    let sharpen = c(pp.sharpness, 0.0, 1.0);
    let vignette = c(pp.vignette, 0.0, 1.0);
    let grain = c(pp.grain_amount, 0.0, 1.0);
    let small_glow = c(pp.glow_small_intensity, 0.0, 1.0);
    let large_glow = c(pp.glow_large_intensity, 0.0, 1.0);
    let glare = c(pp.glare_intensity, 0.0, 1.0);
    let ca = c(pp.ca_strength, 0.0, 0.1);
    let radial_blur_type = known_or(pp.radial_blur_type.as_deref(), RADIAL_BLUR_TYPES, "spin");
    let radial_blur = c(pp.radial_blur_strength, 0.0, 0.5);
    let barrel = c(pp.lens_distortion, -0.2, 0.2);

    NodeSpec::new(POST_PROCESS_NODE)
        .input("image", image)
        .input("enable_upscale", false)
        .input("upscale_model_path", "4x_foolhardy_Remacri.pth")
        .input("downscale_by", 1u32)
        .input("rescale_method", "lanczos")
        .input("precision", "auto")
        .input("batch_size", 1u32)
        // levels
        .input(
            "enable_levels",
            exposure != 0.0 || contrast != 1.0 || saturation != 1.0 || vibrance != 0.0,
        )
        .input("exposure", exposure)
        .input("contrast", contrast)
        .input("saturation", saturation)
        .input("vibrance", vibrance)
        .input("enable_color_wheels", false)
        .input("lift_r", 0u32)
        .input("lift_g", 0u32)
        .input("lift_b", 0u32)
        .input("gamma_r", 1u32)
        .input("gamma_g", 1u32)
        .input("gamma_b", 1u32)
        .input("gain_r", 1u32)
        .input("gain_g", 1u32)
        .input("gain_b", 1u32)
        .input("enable_temp_tint", temperature != 0.0 || tint != 0.0)
        .input("temperature", temperature)
        .input("tint", tint)
        .input("enable_sharpen", sharpen > 0.0)
        .input("sharpen_strength", sharpen)
        .input("sharpen_radius", 1.85)
        .input("sharpen_threshold", 0.015)
        .input("enable_vignette", vignette > 0.0)
        .input("vignette_strength", vignette)
        .input("vignette_radius", 0.7)
        .input("vignette_softness", 2u32)
        .input("enable_film_grain", grain > 0.0)
        .input("grain_intensity", grain * 0.15)
        .input("grain_size", c(pp.grain_size, 0.25, 4.0))
        .input("grain_color_amount", 0.044)
        .input("gamma", 1u32)
        .input("brightness", 0u32)
        // glow
        .input("enable_small_glow", small_glow > 0.0)
        .input("small_glow_intensity", small_glow)
        .input("small_glow_radius", c(pp.glow_small_radius, 0.0, 0.2))
        .input("small_glow_threshold", c(pp.glow_small_threshold, 0.0, 1.0))
        .input("enable_large_glow", large_glow > 0.0)
        .input("large_glow_intensity", large_glow)
        .input("large_glow_radius", c(pp.glow_large_radius, 30.0, 100.0))
        .input("large_glow_threshold", c(pp.glow_large_threshold, 0.0, 1.0))
        // glare
        .input("enable_glare", glare > 0.0)
        .input("glare_type", known_or(pp.glare_type.as_deref(), GLARE_TYPES, "star_4"))
        .input("glare_intensity", glare)
        .input("glare_length", c(pp.glare_length, 1.0, 3.0))
        .input("glare_angle", c(pp.glare_angle, 0.0, 180.0))
        .input("glare_threshold", c(pp.glare_threshold, 0.0, 1.0))
        .input("glare_quality", 16u32)
        .input("glare_ray_width", 1u32)
        // chromatic aberration
        .input("enable_chromatic_aberration", ca > 0.0)
        .input("ca_strength", ca)
        .input("ca_edge_falloff", 2u32)
        .input("enable_ca_hue_shift", false)
        .input("ca_hue_shift_degrees", 0u32)
        // radial blur
        .input(
            "enable_radial_blur",
            radial_blur_type != "none" && radial_blur > 0.0,
        )
        .input("radial_blur_type", radial_blur_type)
        .input("radial_blur_strength", radial_blur)
        .input("radial_blur_center_x", 0.5)
        .input("radial_blur_center_y", 0.5)
        .input("radial_blur_falloff", 0.05)
        .input("radial_blur_samples", 16u32)
        // lens
        .input("enable_lens_distortion", barrel != 0.0)
        .input("barrel_distortion", barrel)
        .input("postprocess_ui", "")
}
