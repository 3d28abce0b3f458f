//! Trait for denoising backbones trained alongside the adapter

use candle_core::Tensor;
use candle_nn::VarMap;

use super::conditioning::{ConditioningBundle, ExtraInputs, StepContext};
use crate::error::Result;

/// Common trait for partially unfrozen denoising networks.
pub trait DenoisingBackbone: Send + Sync {
    /// Predict the scheduler's training target for `noisy_latents`.
    ///
    /// `timestep` is a (batch,) tensor of timetable values. The output has the
    /// latent's shape.
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timestep: &Tensor,
        conditioning: &ConditioningBundle,
        extra: &ExtraInputs,
    ) -> Result<Tensor>;

    /// Inputs that depend on the latent batch rather than on the prompt.
    fn prepare_extra_input(&self, latents: &Tensor, guidance: f64, ctx: &StepContext) -> Result<ExtraInputs> {
        ExtraInputs::guidance_only(latents, guidance, ctx)
    }

    /// Trainable parameters, keyed by their checkpoint names.
    fn var_map(&self) -> &VarMap;

    /// Width of `prompt_emb` the backbone consumes, when fixed.
    fn context_dim(&self) -> Option<usize>;

    fn supports_gradient_checkpointing(&self) -> bool {
        false
    }
}
