//! Pretrained weight loading for the decoder pipeline.
//!
//! The DiT is read fully into memory because its tensors become trainable
//! `Var`s; the text encoder and VAE stay memory-mapped constants.

pub mod lora_merge;

use candle_core::DType;
use candle_transformers::models::flux::model::Config as FluxConfig;
use log::info;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::conditioning::StepContext;
use crate::models::encoders::LatentEncoder;
use crate::models::flux_backbone::FluxBackbone;
use crate::models::flux_vae::load_flux_vae;
use crate::models::text_encoders::load_clip_prompt_encoder;
use crate::models::DecoderPipeline;
use crate::trainers::noise_scheduler::FlowMatchScheduler;

pub use lora_merge::merge_lora;

/// Files making up the pretrained Flux pipeline.
#[derive(Debug, Clone)]
pub struct PretrainedWeights {
    /// Flux DiT in the reference (non-diffusers) key layout.
    pub dit: PathBuf,
    /// CLIP-L text model.
    pub text_encoder: PathBuf,
    /// Flux autoencoder; only needed for batches of pixels.
    pub vae: Option<PathBuf>,
    pub tokenizer: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PresetLora {
    pub path: PathBuf,
    pub alpha: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub flux: FluxConfig,
    /// Storage dtype of trainable weights.
    pub param_dtype: DType,
    /// DiT storage dtype overriding `param_dtype`.
    pub dit_dtype: Option<DType>,
    pub preset_lora: Option<PresetLora>,
    pub num_train_timesteps: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            flux: FluxConfig::dev(),
            param_dtype: DType::F32,
            dit_dtype: None,
            preset_lora: None,
            num_train_timesteps: 1000,
        }
    }
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Config(format!("{} not found: {}", what, path.display())))
    }
}

/// Load the pretrained pipeline: frozen CLIP-L, optional frozen VAE,
/// trainable DiT and the flow-matching scheduler.
pub fn load_flux_pipeline(weights: &PretrainedWeights, ctx: &StepContext, options: &LoadOptions) -> Result<DecoderPipeline> {
    require_file(&weights.dit, "DiT weights")?;
    require_file(&weights.text_encoder, "text encoder weights")?;
    require_file(&weights.tokenizer, "tokenizer")?;
    if let Some(vae) = &weights.vae {
        require_file(vae, "VAE weights")?;
    }

    let prompt_encoder = load_clip_prompt_encoder(&weights.text_encoder, &weights.tokenizer, ctx.dtype, &ctx.device)?;
    let latent_encoder = match &weights.vae {
        Some(path) => Some(Box::new(load_flux_vae(path, ctx.dtype, &ctx.device)?) as Box<dyn LatentEncoder>),
        None => {
            info!("No VAE configured; batches must carry latents");
            None
        }
    };

    info!("Loading Flux DiT from: {}", weights.dit.display());
    let mut dit_tensors = candle_core::safetensors::load(&weights.dit, &ctx.device)?;
    if let Some(preset) = &options.preset_lora {
        require_file(&preset.path, "preset LoRA")?;
        info!("Merging preset LoRA from: {}", preset.path.display());
        let lora = candle_core::safetensors::load(&preset.path, &ctx.device)?;
        merge_lora(&mut dit_tensors, lora, preset.alpha)?;
    }
    let dit_dtype = options.dit_dtype.unwrap_or(options.param_dtype);
    let dit = FluxBackbone::from_tensors(options.flux.clone(), dit_tensors, dit_dtype, &ctx.device)?;

    Ok(DecoderPipeline {
        prompt_encoder: Box::new(prompt_encoder),
        latent_encoder,
        dit: Box::new(dit),
        scheduler: Box::new(FlowMatchScheduler::new(options.num_train_timesteps)?),
    })
}
