//! Which parts of the model receive gradient updates.
//!
//! In candle a parameter tracks gradients only if it is a `Var`. The frozen
//! encoders are loaded as memory-mapped constants, so freezing is decided at
//! load time; this module records the result and enforces that the trainable
//! set is exactly the adapter plus the denoising network.

use candle_core::{TensorId, Var};
use candle_nn::VarMap;
use log::info;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::models::DecoderPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    PromptEncoder,
    LatentEncoder,
    Denoiser,
    Adapter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentMode {
    Train,
    Eval,
}

pub struct FreezePolicy;

impl FreezePolicy {
    pub fn mode_of(component: Component) -> ComponentMode {
        match component {
            Component::Denoiser | Component::Adapter => ComponentMode::Train,
            Component::PromptEncoder | Component::LatentEncoder => ComponentMode::Eval,
        }
    }

    /// Collect the trainable state of `pipeline` and the adapter.
    pub fn apply(pipeline: &DecoderPipeline, adapter: &VarMap) -> Result<TrainableState> {
        for component in [
            Component::PromptEncoder,
            Component::LatentEncoder,
            Component::Denoiser,
            Component::Adapter,
        ] {
            info!("{:?}: {:?}", component, Self::mode_of(component));
        }
        TrainableState::new(named_vars(adapter)?, named_vars(pipeline.denoising_model().var_map())?)
    }
}

/// Sorted (name, var) pairs of a `VarMap`.
pub fn named_vars(var_map: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::Config("var map lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|(a, _), (b, _)| a.cmp(b));
    Ok(vars)
}

/// Adapter and backbone parameters; disjoint by construction.
#[derive(Clone)]
pub struct TrainableState {
    adapter: Vec<(String, Var)>,
    backbone: Vec<(String, Var)>,
}

impl TrainableState {
    pub fn new(adapter: Vec<(String, Var)>, backbone: Vec<(String, Var)>) -> Result<Self> {
        let adapter_ids: HashSet<TensorId> = adapter.iter().map(|(_, v)| v.as_tensor().id()).collect();
        if let Some((name, _)) = backbone
            .iter()
            .find(|(_, v)| adapter_ids.contains(&v.as_tensor().id()))
        {
            return Err(Error::Config(format!(
                "parameter `{}` is owned by both the adapter and the backbone",
                name
            )));
        }
        Ok(Self { adapter, backbone })
    }

    pub fn adapter(&self) -> &[(String, Var)] {
        &self.adapter
    }

    pub fn backbone(&self) -> &[(String, Var)] {
        &self.backbone
    }

    /// Every parameter that receives gradient updates.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.backbone
            .iter()
            .chain(self.adapter.iter())
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.adapter
            .iter()
            .chain(self.backbone.iter())
            .map(|(_, v)| v.elem_count())
            .sum()
    }
}
