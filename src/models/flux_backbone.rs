//! Flux DiT backbone wrapper
//!
//! Latents arrive as [B, C, H, W]. The DiT works on 2x2 patch sequences, so
//! the wrapper patchifies on the way in and restores the latent layout on the
//! way out. Every DiT weight lives in a `VarMap` and is trainable.

use candle_core::{DType, Device, Tensor, TensorId, Var, D};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::flux::model::Config as FluxConfig;
use log::{debug, info};
use std::collections::{HashMap, HashSet};

use super::backbone::DenoisingBackbone;
use super::conditioning::{ConditioningBundle, ExtraInputs, StepContext};
use super::flux_dit::FluxDit;
use crate::error::{Error, Result};

const PATCH_SIZE: usize = 2;

/// Timetable values are sigma * 1000; the DiT embeds sigma itself.
const TIMESTEP_SCALE: f64 = 1000.0;

pub struct FluxBackbone {
    model: FluxDit,
    var_map: VarMap,
    config: FluxConfig,
    dtype: DType,
}

/// Key of a tensor the model asked for but the weights lack.
fn missing_tensor(err: &candle_core::Error) -> Option<&str> {
    match err {
        candle_core::Error::CannotFindTensor { path } => Some(path),
        candle_core::Error::WithBacktrace { inner, .. } => missing_tensor(inner),
        _ => None,
    }
}

impl FluxBackbone {
    /// Build the DiT on top of already-loaded weights.
    ///
    /// Each tensor becomes a `Var` and the model reads exactly those vars.
    /// Loading is strict: a key the model needs but the weights lack, and a
    /// key the model never reads, are both fatal.
    pub fn from_tensors(
        config: FluxConfig,
        tensors: HashMap<String, Tensor>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let var_map = VarMap::new();
        let mut weights = HashMap::with_capacity(tensors.len());
        {
            let mut data = var_map
                .data()
                .lock()
                .map_err(|_| Error::Config("dit var map lock poisoned".to_string()))?;
            for (name, tensor) in tensors {
                let var = Var::from_tensor(&tensor.to_device(device)?.to_dtype(dtype)?)?;
                weights.insert(name.clone(), var.as_tensor().clone());
                data.insert(name, var);
            }
        }

        let vb = VarBuilder::from_tensors(weights, dtype, device);
        let model = FluxDit::new(&config, vb).map_err(|err| match missing_tensor(&err) {
            Some(key) => Error::checkpoint(key, "missing from the DiT weights"),
            None => Error::Candle(err),
        })?;

        let read: HashSet<TensorId> = model.parameters().iter().map(Tensor::id).collect();
        let all_vars = var_map.all_vars();
        if all_vars.len() != read.len() {
            let data = var_map
                .data()
                .lock()
                .map_err(|_| Error::Config("dit var map lock poisoned".to_string()))?;
            let mut unused: Vec<&String> = data
                .iter()
                .filter(|(_, var)| !read.contains(&var.as_tensor().id()))
                .map(|(name, _)| name)
                .collect();
            unused.sort();
            if let Some(key) = unused.first() {
                return Err(Error::checkpoint(key.as_str(), "not used by the DiT"));
            }
        }
        info!("Flux DiT ready with {} trainable tensors", all_vars.len());

        Ok(Self {
            model,
            var_map,
            config,
            dtype,
        })
    }

    /// Build the DiT with freshly initialised weights.
    pub fn new(config: FluxConfig, dtype: DType, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, dtype, device);
        let model = FluxDit::new(&config, vb)?;
        Ok(Self {
            model,
            var_map,
            config,
            dtype,
        })
    }

    pub fn config(&self) -> &FluxConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

/// [B, C, H, W] -> [B, H/2 * W/2, C * 4]
pub fn patchify(latents: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = latents.dims4()?;
    if h % PATCH_SIZE != 0 || w % PATCH_SIZE != 0 {
        return Err(Error::shape(
            "latents",
            "(batch, channels, even height, even width)",
            latents.dims(),
        ));
    }
    let (h2, w2) = (h / PATCH_SIZE, w / PATCH_SIZE);
    Ok(latents
        .reshape((b, c, h2, PATCH_SIZE, w2, PATCH_SIZE))?
        .permute((0, 2, 4, 1, 3, 5))?
        .reshape((b, h2 * w2, c * PATCH_SIZE * PATCH_SIZE))?)
}

/// Inverse of [`patchify`] for a latent of spatial size `height` x `width`.
pub fn unpatchify(patches: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (b, _seq_len, patch_dim) = patches.dims3()?;
    let c = patch_dim / (PATCH_SIZE * PATCH_SIZE);
    let (h2, w2) = (height / PATCH_SIZE, width / PATCH_SIZE);
    Ok(patches
        .reshape((b, h2, w2, c, PATCH_SIZE, PATCH_SIZE))?
        .permute((0, 3, 1, 4, 2, 5))?
        .reshape((b, c, height, width))?)
}

/// Positional ids [B, H/2 * W/2, 3] laid out as (0, row, col).
pub fn image_ids(latents: &Tensor, dtype: DType) -> Result<Tensor> {
    let (b, _c, h, w) = latents.dims4()?;
    let (h2, w2) = (h / PATCH_SIZE, w / PATCH_SIZE);
    let dev = latents.device();
    let ids = Tensor::stack(
        &[
            Tensor::full(0u32, (h2, w2), dev)?,
            Tensor::arange(0u32, h2 as u32, dev)?
                .reshape(((), 1))?
                .broadcast_as((h2, w2))?,
            Tensor::arange(0u32, w2 as u32, dev)?
                .reshape((1, ()))?
                .broadcast_as((h2, w2))?,
        ],
        D::Minus1,
    )?
    .to_dtype(dtype)?;
    Ok(ids.reshape((1, h2 * w2, 3))?.repeat((b, 1, 1))?)
}

impl DenoisingBackbone for FluxBackbone {
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timestep: &Tensor,
        conditioning: &ConditioningBundle,
        extra: &ExtraInputs,
    ) -> Result<Tensor> {
        let (b, _c, h, w) = noisy_latents.dims4()?;
        let context_dim = self.config.context_in_dim;
        if conditioning.prompt_emb.dim(D::Minus1)? != context_dim
            || conditioning.prompt_emb.dim(0)? != b
        {
            return Err(Error::shape(
                "prompt_emb",
                format!("({}, sequence, {})", b, context_dim),
                conditioning.prompt_emb.dims(),
            ));
        }

        let pooled = conditioning
            .pooled_prompt_emb
            .as_ref()
            .ok_or_else(|| Error::Config("Flux backbone requires a pooled prompt embedding".to_string()))?;
        let pooled = match pooled.dims2()? {
            (pb, dim) if dim == self.config.vec_in_dim && pb == b => pooled.clone(),
            (1, dim) if dim == self.config.vec_in_dim => pooled.repeat((b, 1))?,
            _ => {
                return Err(Error::shape(
                    "pooled_prompt_emb",
                    format!("({}, {})", b, self.config.vec_in_dim),
                    pooled.dims(),
                ))
            }
        };

        // Inputs follow the step dtype; the DiT may be stored in another one
        let img = patchify(noisy_latents)?.to_dtype(self.dtype)?;
        let img_ids = match &extra.image_ids {
            Some(ids) => ids.to_dtype(self.dtype)?,
            None => image_ids(noisy_latents, self.dtype)?,
        };
        let txt = conditioning.prompt_emb.to_dtype(self.dtype)?;
        let txt_ids = conditioning.text_ids.to_dtype(self.dtype)?;
        let pooled = pooled.to_dtype(self.dtype)?;
        let timestep = timestep.affine(1.0 / TIMESTEP_SCALE, 0.0)?.to_dtype(self.dtype)?;
        let guidance = if self.config.guidance_embed {
            Some(extra.guidance.to_dtype(self.dtype)?)
        } else {
            None
        };

        debug!(
            "flux forward: img {:?}, txt {:?}, y {:?}",
            img.dims(),
            conditioning.prompt_emb.dims(),
            pooled.dims()
        );
        let out = self.model.forward(
            &img,
            &img_ids,
            &txt,
            &txt_ids,
            &timestep,
            &pooled,
            guidance.as_ref(),
        )?;
        unpatchify(&out.to_dtype(noisy_latents.dtype())?, h, w)
    }

    fn prepare_extra_input(&self, latents: &Tensor, guidance: f64, ctx: &StepContext) -> Result<ExtraInputs> {
        let mut extra = ExtraInputs::guidance_only(latents, guidance, ctx)?;
        extra.image_ids = Some(image_ids(latents, ctx.dtype)?);
        Ok(extra)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn context_dim(&self) -> Option<usize> {
        Some(self.config.context_in_dim)
    }
}
