//! Projection from external embeddings into the Flux prompt-embedding space.

use candle_core::{DType, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::norms::LayerNorm;
use crate::error::{Error, Result};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Shape parameters of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedAdapterConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub expand_ratio: usize,
}

impl EmbedAdapterConfig {
    pub fn hidden_channels(&self) -> usize {
        self.out_channels * self.expand_ratio
    }
}

impl Default for EmbedAdapterConfig {
    fn default() -> Self {
        Self {
            in_channels: 3584,
            out_channels: 4096,
            expand_ratio: 1,
        }
    }
}

/// Linear -> LayerNorm -> ReLU -> Linear -> LayerNorm.
///
/// Weights are named by position (`0`, `1`, `3`, `4`; the ReLU at `2` has
/// none) so checkpoints line up with an indexed sequential container.
/// Inputs are cast to the weight dtype, so f32 weights can serve an f16 step.
pub struct EmbedAdapter {
    proj_in: Linear,
    norm_in: LayerNorm,
    proj_out: Linear,
    norm_out: LayerNorm,
    config: EmbedAdapterConfig,
}

impl EmbedAdapter {
    pub fn new(config: EmbedAdapterConfig, vb: VarBuilder) -> Result<Self> {
        if config.in_channels == 0 || config.out_channels == 0 || config.expand_ratio == 0 {
            return Err(Error::Config(format!(
                "adapter dimensions must be non-zero, got {:?}",
                config
            )));
        }
        let hidden = config.hidden_channels();
        let proj_in = linear(config.in_channels, hidden, vb.pp("0"))?;
        let norm_in = LayerNorm::new(hidden, LAYER_NORM_EPS, vb.pp("1"))?;
        let proj_out = linear(hidden, config.out_channels, vb.pp("3"))?;
        let norm_out = LayerNorm::new(config.out_channels, LAYER_NORM_EPS, vb.pp("4"))?;

        Ok(Self {
            proj_in,
            norm_in,
            proj_out,
            norm_out,
            config,
        })
    }

    pub fn config(&self) -> &EmbedAdapterConfig {
        &self.config
    }

    /// Dtype of the adapter weights and of its output.
    pub fn dtype(&self) -> DType {
        self.proj_in.weight().dtype()
    }

    /// Map (batch, sequence, in_channels) to (batch, sequence, out_channels).
    pub fn forward(&self, embed: &Tensor) -> Result<Tensor> {
        let expected = format!("(batch, sequence, {})", self.config.in_channels);
        let (_, _, channels) = embed
            .dims3()
            .map_err(|_| Error::shape("embed", expected.clone(), embed.dims()))?;
        if channels != self.config.in_channels {
            return Err(Error::shape("embed", expected, embed.dims()));
        }

        let xs = self.proj_in.forward(&embed.to_dtype(self.dtype())?)?;
        let xs = self.norm_in.forward(&xs)?.relu()?;
        let xs = self.proj_out.forward(&xs)?;
        Ok(self.norm_out.forward(&xs)?)
    }
}
