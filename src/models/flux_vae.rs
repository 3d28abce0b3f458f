// flux_vae.rs
// Frozen Flux VAE encoder using candle-transformers implementation

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::flux;
use log::info;
use std::path::Path;

use super::conditioning::StepContext;
use super::encoders::LatentEncoder;
use crate::error::{Error, Result};

/// Wrapper around candle-transformers Flux AutoEncoder.
///
/// Weights are memory-mapped constants, so nothing here ever receives a
/// gradient.
pub struct FluxVae {
    inner: flux::autoencoder::AutoEncoder,
    dtype: DType,
}

impl FluxVae {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let dtype = vb.dtype();
        // Same autoencoder for dev and schnell
        let config = flux::autoencoder::Config::dev();
        let inner = flux::autoencoder::AutoEncoder::new(&config, vb)?;
        Ok(Self { inner, dtype })
    }
}

impl LatentEncoder for FluxVae {
    fn encode(&self, image: &Tensor, ctx: &StepContext) -> Result<Tensor> {
        let (_, channels, _, _) = image.dims4()?;
        if channels != 3 {
            return Err(Error::shape("image", "(batch, 3, height, width)", image.dims()));
        }
        let image = image.to_device(&ctx.device)?.to_dtype(self.dtype)?;
        // AutoEncoder::encode applies the shift and scale factors itself
        let latents = self.inner.encode(&image)?;
        Ok(latents.to_dtype(ctx.dtype)?.detach())
    }
}

/// Load Flux VAE from ae.safetensors
pub fn load_flux_vae(vae_path: &Path, dtype: DType, device: &Device) -> Result<FluxVae> {
    if !vae_path.exists() {
        return Err(Error::Config(format!("VAE weights not found: {}", vae_path.display())));
    }
    info!("Loading Flux VAE from: {}", vae_path.display());

    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[vae_path], dtype, device)? };
    FluxVae::new(vb)
}
