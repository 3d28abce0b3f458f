//! Embedding-conditioned decoder: adapter + partially unfrozen Flux pipeline.
//!
//! One training step maps an external embedding through the adapter into
//! the backbone's prompt-embedding slot, noises the target latent at a
//! random timetable entry and regresses the scheduler's target.

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::{debug, info};
use rand::Rng;

use super::checkpoint::{match_vars, write_vars, CheckpointRecord, ADAPTER_PREFIX, DIT_PREFIX};
use super::freeze::{FreezePolicy, TrainableState};
use crate::error::{Error, Result};
use crate::models::conditioning::StepContext;
use crate::models::embed_adapter::{EmbedAdapter, EmbedAdapterConfig};
use crate::models::DecoderPipeline;
use crate::trainers::batch::TrainingBatch;

/// Default embedded guidance for Flux-dev style backbones.
pub const DEFAULT_GUIDANCE: f64 = 3.5;

#[derive(Debug, Clone)]
pub struct GenerationDecoderConfig {
    pub adapter: EmbedAdapterConfig,
    pub guidance: f64,
    pub use_gradient_checkpointing: bool,
    pub ctx: StepContext,
    /// Dtype of the adapter weights; activations follow `ctx.dtype`.
    pub param_dtype: DType,
}

impl GenerationDecoderConfig {
    pub fn new(adapter: EmbedAdapterConfig, ctx: StepContext) -> Self {
        Self {
            adapter,
            guidance: DEFAULT_GUIDANCE,
            use_gradient_checkpointing: false,
            ctx,
            param_dtype: DType::F32,
        }
    }
}

/// Random draws of one step. Fixing them makes the loss reproducible.
#[derive(Debug, Clone)]
pub struct StepDraws {
    pub noise: Tensor,
    pub timestep_id: usize,
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Weighted scalar loss, still attached to the graph.
    pub loss: Tensor,
    pub loss_value: f32,
    pub timestep_id: usize,
    pub timestep: f64,
}

pub struct GenerationDecoder {
    pipe: DecoderPipeline,
    adapter: EmbedAdapter,
    adapter_vars: VarMap,
    trainable: TrainableState,
    config: GenerationDecoderConfig,
}

impl GenerationDecoder {
    /// Build the adapter, apply the freezing policy and, when given, restore
    /// a prior checkpoint over both trainable parts.
    pub fn new(
        pipe: DecoderPipeline,
        config: GenerationDecoderConfig,
        load_from: Option<&CheckpointRecord>,
    ) -> Result<Self> {
        if config.use_gradient_checkpointing && !pipe.denoising_model().supports_gradient_checkpointing() {
            return Err(Error::Config(
                "gradient checkpointing requested but the denoising backbone does not support it".to_string(),
            ));
        }
        if let Some(context_dim) = pipe.denoising_model().context_dim() {
            if context_dim != config.adapter.out_channels {
                return Err(Error::Config(format!(
                    "adapter out_channels {} does not match backbone context width {}",
                    config.adapter.out_channels, context_dim
                )));
            }
        }

        let adapter_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&adapter_vars, config.param_dtype, &config.ctx.device);
        let adapter = EmbedAdapter::new(config.adapter, vb)?;
        let trainable = FreezePolicy::apply(&pipe, &adapter_vars)?;
        info!(
            "Decoder ready: adapter {} -> {} (x{}), {} trainable parameters",
            config.adapter.in_channels,
            config.adapter.out_channels,
            config.adapter.expand_ratio,
            trainable.num_parameters()
        );

        let decoder = Self {
            pipe,
            adapter,
            adapter_vars,
            trainable,
            config,
        };
        if let Some(record) = load_from {
            decoder.load_state_record(record)?;
            info!("Restored {} checkpoint tensors", record.len());
        }
        Ok(decoder)
    }

    pub fn pipeline(&self) -> &DecoderPipeline {
        &self.pipe
    }

    pub fn adapter(&self) -> &EmbedAdapter {
        &self.adapter
    }

    pub fn adapter_vars(&self) -> &VarMap {
        &self.adapter_vars
    }

    pub fn trainable(&self) -> &TrainableState {
        &self.trainable
    }

    pub fn context(&self) -> &StepContext {
        &self.config.ctx
    }

    pub fn config(&self) -> &GenerationDecoderConfig {
        &self.config
    }

    pub fn training_step(&self, batch: &TrainingBatch) -> Result<StepOutput> {
        self.training_step_with_rng(batch, &mut rand::thread_rng())
    }

    /// Full step with the timestep index drawn from `rng`.
    pub fn training_step_with_rng<R: Rng + ?Sized>(&self, batch: &TrainingBatch, rng: &mut R) -> Result<StepOutput> {
        let latents = self.resolve_latents(batch)?;
        let draws = self.sample_draws(&latents, rng)?;
        self.loss_with_latents(batch, &latents, &draws)
    }

    /// Fresh standard-normal noise shaped like `latents` and a uniform index
    /// into the timetable. One index is shared by the whole batch.
    pub fn sample_draws<R: Rng + ?Sized>(&self, latents: &Tensor, rng: &mut R) -> Result<StepDraws> {
        let num_timesteps = self.pipe.scheduler.timesteps().len();
        if num_timesteps == 0 {
            return Err(Error::Config("scheduler has an empty timetable".to_string()));
        }
        Ok(StepDraws {
            noise: latents.randn_like(0.0, 1.0)?,
            timestep_id: rng.gen_range(0..num_timesteps),
        })
    }

    /// Latents from the batch, or encoded from its pixels.
    pub fn resolve_latents(&self, batch: &TrainingBatch) -> Result<Tensor> {
        let ctx = &self.config.ctx;
        if let Some(latents) = &batch.latents {
            return Ok(latents.to_device(&ctx.device)?.to_dtype(ctx.dtype)?);
        }
        let image = batch.image.as_ref().ok_or(Error::MissingBatchField("latents"))?;
        let encoder = self.pipe.latent_encoder.as_ref().ok_or_else(|| {
            Error::Config("batch carries pixels but no latent encoder is loaded".to_string())
        })?;
        let image = image.to_device(&ctx.device)?.to_dtype(ctx.dtype)?;
        encoder.encode(&image, ctx)
    }

    /// Deterministic loss for fixed draws.
    pub fn compute_loss(&self, batch: &TrainingBatch, draws: &StepDraws) -> Result<StepOutput> {
        let latents = self.resolve_latents(batch)?;
        self.loss_with_latents(batch, &latents, draws)
    }

    fn loss_with_latents(&self, batch: &TrainingBatch, latents: &Tensor, draws: &StepDraws) -> Result<StepOutput> {
        let ctx = &self.config.ctx;
        let batch_size = batch.batch_size()?;
        if latents.dim(0)? != batch_size {
            return Err(Error::shape(
                "latents",
                format!("batch of {} to match embed", batch_size),
                latents.dims(),
            ));
        }
        if draws.noise.dims() != latents.dims() {
            return Err(Error::shape("noise", format!("{:?}", latents.dims()), draws.noise.dims()));
        }

        // Empty prompt supplies the pooled vector; the adapter supplies the sequence
        let baseline = self.pipe.prompt_encoder.encode_prompt("", batch_size, ctx)?;
        let embed = batch.embed.to_device(&ctx.device)?.to_dtype(ctx.dtype)?;
        let projected = self.adapter.forward(&embed)?.to_dtype(ctx.dtype)?;
        let conditioning = baseline.with_projection(projected)?;

        let scheduler = self.pipe.scheduler.as_ref();
        let timestep = *scheduler.timesteps().get(draws.timestep_id).ok_or_else(|| {
            Error::Config(format!(
                "timestep index {} outside timetable of {}",
                draws.timestep_id,
                scheduler.timesteps().len()
            ))
        })?;

        let dit = self.pipe.denoising_model();
        let extra = dit.prepare_extra_input(latents, self.config.guidance, ctx)?;
        let noise = draws.noise.to_dtype(latents.dtype())?;
        let noisy = scheduler.add_noise(latents, &noise, timestep)?;
        let target = scheduler.training_target(latents, &noise, timestep)?;

        let timesteps = Tensor::full(timestep as f32, batch_size, &ctx.device)?.to_dtype(ctx.dtype)?;
        let pred = dit.forward(&noisy, &timesteps, &conditioning, &extra)?;
        if pred.dims() != target.dims() {
            return Err(Error::shape("prediction", format!("{:?}", target.dims()), pred.dims()));
        }

        let weight = scheduler.training_weight(timestep)?;
        let loss = candle_nn::loss::mse(&pred.to_dtype(DType::F32)?, &target.to_dtype(DType::F32)?)?
            .affine(weight, 0.0)?;
        let loss_value = loss.to_scalar::<f32>()?;
        if !loss_value.is_finite() {
            return Err(Error::NonFiniteLoss {
                loss: loss_value,
                timestep,
            });
        }
        debug!("step: timestep {} (#{}), weight {:.4}, loss {:.6}", timestep, draws.timestep_id, weight, loss_value);

        Ok(StepOutput {
            loss,
            loss_value,
            timestep_id: draws.timestep_id,
            timestep,
        })
    }

    /// Weights-only snapshot of the backbone and adapter.
    pub fn state_record(&self) -> Result<CheckpointRecord> {
        CheckpointRecord::from_vars(self.trainable.backbone(), self.trainable.adapter())
    }

    /// Strictly restore both trainable parts; nothing is written unless the
    /// whole record matches.
    pub fn load_state_record(&self, record: &CheckpointRecord) -> Result<()> {
        let parts = record.split()?;
        let mut updates = match_vars(DIT_PREFIX, self.trainable.backbone(), parts.dit)?;
        updates.extend(match_vars(ADAPTER_PREFIX, self.trainable.adapter(), parts.adapter)?);
        write_vars(updates)
    }
}
