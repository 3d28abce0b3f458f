#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use candle_transformers::models::flux::model::Config as FluxConfig;
use generation_decoder::models::{
    ConditioningBundle, DecoderPipeline, DenoisingBackbone, EmbedAdapterConfig, ExtraInputs, FluxBackbone,
    PromptEmbeds, PromptEncoder, StepContext,
};
use generation_decoder::trainers::{FlowMatchScheduler, GenerationDecoderConfig, NoiseScheduler};
use generation_decoder::Result;

/// Frozen prompt encoder: a constant pooled vector, no parameters.
pub struct ConstantPrompt {
    pooled: Tensor,
}

impl ConstantPrompt {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pooled: Tensor::ones((1, 4), DType::F32, &Device::Cpu)?,
        })
    }
}

impl PromptEncoder for ConstantPrompt {
    fn encode_prompt(&self, _prompt: &str, batch_size: usize, ctx: &StepContext) -> Result<PromptEmbeds> {
        Ok(PromptEmbeds {
            prompt_emb: None,
            pooled_prompt_emb: Some(self.pooled.to_dtype(ctx.dtype)?.repeat((batch_size, 1))?),
        })
    }
}

/// Returns its noisy input times a trainable scalar initialised to 1.
pub struct IdentityBackbone {
    var_map: VarMap,
    scale: Tensor,
    context_dim: usize,
}

impl IdentityBackbone {
    pub fn new(context_dim: usize) -> Result<Self> {
        let var_map = VarMap::new();
        let scale = var_map.get((1,), "scale", candle_nn::Init::Const(1.0), DType::F32, &Device::Cpu)?;
        Ok(Self {
            var_map,
            scale,
            context_dim,
        })
    }
}

impl DenoisingBackbone for IdentityBackbone {
    fn forward(
        &self,
        noisy_latents: &Tensor,
        _timestep: &Tensor,
        conditioning: &ConditioningBundle,
        _extra: &ExtraInputs,
    ) -> Result<Tensor> {
        assert_eq!(conditioning.prompt_emb.dim(2)?, self.context_dim);
        Ok(noisy_latents.broadcast_mul(&self.scale)?)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn context_dim(&self) -> Option<usize> {
        Some(self.context_dim)
    }
}

/// `add_noise = latent + noise`, target `noise`, weight 1.
pub struct AdditiveScheduler {
    timesteps: Vec<f64>,
}

impl AdditiveScheduler {
    pub fn new(num_train_timesteps: usize) -> Self {
        Self {
            timesteps: (0..num_train_timesteps).map(|t| t as f64).collect(),
        }
    }
}

impl NoiseScheduler for AdditiveScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.timesteps.len()
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn add_noise(&self, latents: &Tensor, noise: &Tensor, _timestep: f64) -> Result<Tensor> {
        Ok((latents + noise)?)
    }

    fn training_target(&self, _latents: &Tensor, noise: &Tensor, _timestep: f64) -> Result<Tensor> {
        Ok(noise.clone())
    }

    fn training_weight(&self, _timestep: f64) -> Result<f64> {
        Ok(1.0)
    }
}

pub const IN_CHANNELS: usize = 8;
pub const OUT_CHANNELS: usize = 16;
pub const NUM_TIMESTEPS: usize = 10;

pub fn stub_pipeline() -> Result<DecoderPipeline> {
    Ok(DecoderPipeline {
        prompt_encoder: Box::new(ConstantPrompt::new()?),
        latent_encoder: None,
        dit: Box::new(IdentityBackbone::new(OUT_CHANNELS)?),
        scheduler: Box::new(AdditiveScheduler::new(NUM_TIMESTEPS)),
    })
}

/// Smallest Flux DiT matching the stub prompt and adapter widths.
pub fn tiny_flux_config() -> FluxConfig {
    FluxConfig {
        in_channels: 16,
        vec_in_dim: 4,
        context_in_dim: OUT_CHANNELS,
        hidden_size: 32,
        mlp_ratio: 2.0,
        num_heads: 2,
        depth: 1,
        depth_single_blocks: 1,
        axes_dim: vec![4, 6, 6],
        theta: 10_000,
        qkv_bias: true,
        guidance_embed: true,
    }
}

/// Stub prompt encoder in front of a randomly initialised tiny Flux DiT.
pub fn tiny_flux_pipeline() -> Result<DecoderPipeline> {
    Ok(DecoderPipeline {
        prompt_encoder: Box::new(ConstantPrompt::new()?),
        latent_encoder: None,
        dit: Box::new(FluxBackbone::new(tiny_flux_config(), DType::F32, &Device::Cpu)?),
        scheduler: Box::new(FlowMatchScheduler::new(NUM_TIMESTEPS)?),
    })
}

pub fn decoder_config() -> GenerationDecoderConfig {
    GenerationDecoderConfig::new(
        EmbedAdapterConfig {
            in_channels: IN_CHANNELS,
            out_channels: OUT_CHANNELS,
            expand_ratio: 1,
        },
        StepContext::cpu_f32(),
    )
}

/// Deterministic stand-in for a seeded normal draw.
pub fn known_noise(shape: (usize, usize, usize, usize)) -> Result<Tensor> {
    let n = shape.0 * shape.1 * shape.2 * shape.3;
    Ok(Tensor::arange(0u32, n as u32, &Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(0.37, -1.0)?
        .sin()?
        .reshape(shape)?)
}
