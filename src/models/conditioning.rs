//! Conditioning inputs passed from the step orchestrator to the backbone.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Device and dtype threaded through every encoder and backbone call.
///
/// Nothing in the pipeline stores a "current device"; callers hand this in.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub device: Device,
    pub dtype: DType,
}

impl StepContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn cpu_f32() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }
}

/// Output of a prompt encoder for one prompt, repeated over the batch.
#[derive(Debug, Clone, Default)]
pub struct PromptEmbeds {
    /// Sequence embedding, absent for clip-only encoding.
    pub prompt_emb: Option<Tensor>,
    /// Pooled prompt vector, (batch, pooled_dim).
    pub pooled_prompt_emb: Option<Tensor>,
}

impl PromptEmbeds {
    /// Replace the sequence embedding with `projected` and attach zero
    /// positional ids shaped like its batch and sequence dimensions.
    pub fn with_projection(self, projected: Tensor) -> Result<ConditioningBundle> {
        let (batch, seq_len, _) = projected
            .dims3()
            .map_err(|_| Error::shape("prompt_emb", "(batch, sequence, channels)", projected.dims()))?;
        if let Some(pooled) = &self.pooled_prompt_emb {
            let pooled_batch = pooled.dim(0)?;
            if pooled_batch != batch && pooled_batch != 1 {
                return Err(Error::shape(
                    "pooled_prompt_emb",
                    format!("({} or 1, pooled_dim)", batch),
                    pooled.dims(),
                ));
            }
        }
        let text_ids = Tensor::zeros((batch, seq_len, 3), projected.dtype(), projected.device())?;
        Ok(ConditioningBundle {
            prompt_emb: projected,
            text_ids,
            pooled_prompt_emb: self.pooled_prompt_emb,
        })
    }
}

/// Prompt-side conditioning for one step.
#[derive(Debug, Clone)]
pub struct ConditioningBundle {
    /// Primary conditioning sequence, (batch, sequence, context_dim).
    pub prompt_emb: Tensor,
    /// Positional ids for the conditioning sequence, (batch, sequence, 3).
    pub text_ids: Tensor,
    /// Pooled prompt vector, (batch, pooled_dim), for backbones that read it.
    pub pooled_prompt_emb: Option<Tensor>,
}

/// Scheduler-dependent inputs prepared per latent batch.
#[derive(Debug, Clone)]
pub struct ExtraInputs {
    /// Guidance scale per batch element, (batch,).
    pub guidance: Tensor,
    /// Positional ids of the image tokens, when the backbone uses them.
    pub image_ids: Option<Tensor>,
}

impl ExtraInputs {
    /// Guidance-only inputs: `guidance` repeated over the latent batch.
    pub fn guidance_only(latents: &Tensor, guidance: f64, ctx: &StepContext) -> Result<Self> {
        let batch = latents.dim(0)?;
        let guidance = Tensor::full(guidance as f32, batch, &ctx.device)?.to_dtype(ctx.dtype)?;
        Ok(Self {
            guidance,
            image_ids: None,
        })
    }
}
