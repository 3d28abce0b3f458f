//! Merge a preset LoRA into dense DiT weights before training starts.
//!
//! Expected key layout: `<base>.lora_A.weight` (rank x in) and
//! `<base>.lora_B.weight` (out x rank) for a dense `<base>.weight`.

use candle_core::{DType, Tensor};
use log::info;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

const LORA_A_SUFFIX: &str = ".lora_A.weight";
const LORA_B_SUFFIX: &str = ".lora_B.weight";

#[derive(Default)]
struct LoraPair {
    down: Option<Tensor>,
    up: Option<Tensor>,
}

/// `W += (alpha / rank) * B @ A` for every pair in `lora`.
///
/// `alpha` defaults to the rank of each pair, i.e. a scale of 1. Returns the
/// number of merged layers.
pub fn merge_lora(
    weights: &mut HashMap<String, Tensor>,
    lora: HashMap<String, Tensor>,
    alpha: Option<f64>,
) -> Result<usize> {
    let mut pairs: BTreeMap<String, LoraPair> = BTreeMap::new();
    for (key, tensor) in lora {
        if let Some(base) = key.strip_suffix(LORA_A_SUFFIX) {
            pairs.entry(base.to_string()).or_default().down = Some(tensor);
        } else if let Some(base) = key.strip_suffix(LORA_B_SUFFIX) {
            pairs.entry(base.to_string()).or_default().up = Some(tensor);
        } else {
            return Err(Error::checkpoint(key, "not a LoRA A/B weight"));
        }
    }

    let mut merged = 0;
    for (base, pair) in pairs {
        let (Some(down), Some(up)) = (pair.down, pair.up) else {
            return Err(Error::checkpoint(base, "LoRA pair is missing its A or B half"));
        };
        let weight_key = format!("{}.weight", base);
        let weight = weights
            .get(&weight_key)
            .ok_or_else(|| Error::checkpoint(weight_key.clone(), "LoRA targets a weight the DiT does not have"))?;

        let rank = down.dim(0)?;
        let scale = alpha.unwrap_or(rank as f64) / rank as f64;
        let delta = up.to_dtype(DType::F32)?.matmul(&down.to_dtype(DType::F32)?)?;
        if delta.dims() != weight.dims() {
            return Err(Error::checkpoint(
                weight_key,
                format!("LoRA delta {:?} does not match weight {:?}", delta.dims(), weight.dims()),
            ));
        }
        let delta = delta.affine(scale, 0.0)?.to_device(weight.device())?;
        let updated = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(weight.dtype())?;
        weights.insert(weight_key, updated);
        merged += 1;
    }
    info!("Merged {} preset LoRA layers", merged);
    Ok(merged)
}
