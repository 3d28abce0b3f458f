//! The pretrained pipeline the decoder fine-tunes.

use super::backbone::DenoisingBackbone;
use super::encoders::{LatentEncoder, PromptEncoder};
use crate::trainers::noise_scheduler::NoiseScheduler;

/// Assembled pretrained components.
///
/// Only the denoising network carries trainable parameters; the encoders are
/// loaded as constants.
pub struct DecoderPipeline {
    pub prompt_encoder: Box<dyn PromptEncoder>,
    /// Needed only when batches carry images instead of latents.
    pub latent_encoder: Option<Box<dyn LatentEncoder>>,
    pub dit: Box<dyn DenoisingBackbone>,
    pub scheduler: Box<dyn NoiseScheduler>,
}

impl DecoderPipeline {
    pub fn denoising_model(&self) -> &dyn DenoisingBackbone {
        self.dit.as_ref()
    }
}
