//! Frozen CLIP-L prompt encoder for Flux.
//!
//! Only the pooled output is used: the sequence embedding that T5 would
//! provide is replaced by the adapter's projection, so the T5 encoder is
//! never loaded.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer};
use log::info;
use std::path::Path;
use tokenizers::Tokenizer;

use super::conditioning::{PromptEmbeds, StepContext};
use super::encoders::PromptEncoder;
use crate::error::{Error, Result};

const CLIP_MAX_TOKENS: usize = 77;

/// CLIP ViT-L/14 text tower, as shipped with Flux.
pub fn clip_l_config() -> ClipTextConfig {
    ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: CLIP_MAX_TOKENS,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    }
}

pub struct ClipPromptEncoder {
    model: ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl ClipPromptEncoder {
    pub fn new(vb: VarBuilder, tokenizer: Tokenizer) -> Result<Self> {
        let device = vb.device().clone();
        let model = ClipTextTransformer::new(vb.pp("text_model"), &clip_l_config())?;
        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    fn tokenize(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self.tokenizer.encode(prompt, true)?.get_ids().to_vec();
        tokens.truncate(CLIP_MAX_TOKENS);
        Ok(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?)
    }
}

impl PromptEncoder for ClipPromptEncoder {
    fn encode_prompt(&self, prompt: &str, batch_size: usize, ctx: &StepContext) -> Result<PromptEmbeds> {
        let tokens = self.tokenize(prompt)?;
        let pooled = self
            .model
            .forward(&tokens)?
            .to_device(&ctx.device)?
            .to_dtype(ctx.dtype)?
            .detach();
        Ok(PromptEmbeds {
            prompt_emb: None,
            pooled_prompt_emb: Some(pooled.repeat((batch_size, 1))?),
        })
    }
}

/// Load CLIP-L weights and its tokenizer.
pub fn load_clip_prompt_encoder(
    model_path: &Path,
    tokenizer_path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<ClipPromptEncoder> {
    for path in [model_path, tokenizer_path] {
        if !path.exists() {
            return Err(Error::Config(format!("text encoder file not found: {}", path.display())));
        }
    }
    info!("Loading CLIP-L from: {}", model_path.display());

    let tokenizer = Tokenizer::from_file(tokenizer_path)
        .map_err(|e| Error::Tokenizer(format!("failed to load CLIP tokenizer: {}", e)))?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], dtype, device)? };
    ClipPromptEncoder::new(vb, tokenizer)
}
