//! Frozen encoders consumed by the step orchestrator.

use candle_core::Tensor;

use super::conditioning::{PromptEmbeds, StepContext};
use crate::error::Result;

/// Text side of the pretrained pipeline. Never trained.
pub trait PromptEncoder: Send + Sync {
    /// Encode `prompt` and repeat the result over `batch_size` rows.
    fn encode_prompt(&self, prompt: &str, batch_size: usize, ctx: &StepContext) -> Result<PromptEmbeds>;
}

/// Image -> latent encoder of the pretrained pipeline. Never trained.
pub trait LatentEncoder: Send + Sync {
    /// `image` is [B, 3, H, W] in [-1, 1]; the result is [B, C, H/8, W/8]
    /// in the backbone's latent scale.
    fn encode(&self, image: &Tensor, ctx: &StepContext) -> Result<Tensor>;
}
