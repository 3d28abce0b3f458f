//! Weights-only checkpoints of the adapter and the denoising network.
//!
//! A record is a flat key -> tensor map. Backbone keys live under
//! `pipe.dit.`, adapter keys under `adapter.`; nothing else is stored, so
//! optimizer moments and scheduler position are never part of a checkpoint.

use candle_core::{Device, Tensor, Var};
use log::info;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

pub const DIT_PREFIX: &str = "pipe.dit.";
pub const ADAPTER_PREFIX: &str = "adapter.";

#[derive(Debug, Clone, Default)]
pub struct CheckpointRecord {
    tensors: HashMap<String, Tensor>,
}

/// Un-prefixed tensors for each owned sub-network.
#[derive(Debug, Default)]
pub struct CheckpointParts {
    pub dit: HashMap<String, Tensor>,
    pub adapter: HashMap<String, Tensor>,
}

impl CheckpointRecord {
    /// Snapshot both parameter sets under their prefixes.
    ///
    /// Values are deep-copied: optimizer updates write into `Var` storage in
    /// place, and a record must not change after it is taken.
    pub fn from_vars(dit: &[(String, Var)], adapter: &[(String, Var)]) -> Result<Self> {
        let mut tensors = HashMap::with_capacity(dit.len() + adapter.len());
        for (prefix, vars) in [(DIT_PREFIX, dit), (ADAPTER_PREFIX, adapter)] {
            for (name, var) in vars {
                tensors.insert(format!("{}{}", prefix, name), var.as_tensor().copy()?);
            }
        }
        Ok(Self { tensors })
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Split by prefix and strip it. A key under neither prefix is an error.
    pub fn split(&self) -> Result<CheckpointParts> {
        let mut parts = CheckpointParts::default();
        for (key, tensor) in &self.tensors {
            if let Some(name) = key.strip_prefix(ADAPTER_PREFIX) {
                parts.adapter.insert(name.to_string(), tensor.clone());
            } else if let Some(name) = key.strip_prefix(DIT_PREFIX) {
                parts.dit.insert(name.to_string(), tensor.clone());
            } else {
                return Err(Error::checkpoint(key.clone(), "not under a known prefix"));
            }
        }
        Ok(parts)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        candle_core::safetensors::save(&self.tensors, path)?;
        info!("Saved {} tensors to {}", self.tensors.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!("checkpoint not found: {}", path.display())));
        }
        let tensors = candle_core::safetensors::load(path, device)?;
        info!("Loaded {} tensors from {}", tensors.len(), path.display());
        Ok(Self { tensors })
    }
}

/// Pair every var in `vars` with its entry in `tensors`, without writing.
///
/// Strict: a var without an entry, an entry without a var, or a shape
/// mismatch is an error naming the prefixed key.
pub(crate) fn match_vars(
    prefix: &str,
    vars: &[(String, Var)],
    mut tensors: HashMap<String, Tensor>,
) -> Result<Vec<(Var, Tensor)>> {
    let mut updates = Vec::with_capacity(vars.len());
    for (name, var) in vars {
        let tensor = tensors
            .remove(name)
            .ok_or_else(|| Error::checkpoint(format!("{}{}", prefix, name), "missing from checkpoint"))?;
        if tensor.dims() != var.dims() {
            return Err(Error::checkpoint(
                format!("{}{}", prefix, name),
                format!("shape {:?} does not match parameter shape {:?}", tensor.dims(), var.dims()),
            ));
        }
        let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
        updates.push((var.clone(), tensor));
    }
    if let Some(unexpected) = tensors.keys().min() {
        return Err(Error::checkpoint(
            format!("{}{}", prefix, unexpected),
            "unexpected key, no such parameter",
        ));
    }
    Ok(updates)
}

pub(crate) fn write_vars(updates: Vec<(Var, Tensor)>) -> Result<()> {
    for (var, tensor) in updates {
        var.set(&tensor)?;
    }
    Ok(())
}

/// Overwrite every var in `vars` with its entry in `tensors`.
///
/// Nothing is written unless every entry matches.
pub fn restore_vars(prefix: &str, vars: &[(String, Var)], tensors: HashMap<String, Tensor>) -> Result<()> {
    write_vars(match_vars(prefix, vars, tensors)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(values: &[f32]) -> Result<Var> {
        Ok(Var::from_tensor(&Tensor::new(values, &Device::Cpu)?)?)
    }

    #[test]
    fn test_keys_are_namespaced() -> Result<()> {
        let dit = vec![("img_in.weight".to_string(), var(&[1.0, 2.0])?)];
        let adapter = vec![("0.weight".to_string(), var(&[3.0])?)];
        let record = CheckpointRecord::from_vars(&dit, &adapter)?;

        let mut keys: Vec<&String> = record.tensors().keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["adapter.0.weight", "pipe.dit.img_in.weight"]);
        Ok(())
    }

    #[test]
    fn test_record_is_a_snapshot() -> Result<()> {
        let weight = var(&[1.0, 2.0])?;
        let record = CheckpointRecord::from_vars(&[("w".to_string(), weight.clone())], &[])?;
        weight.set(&Tensor::new(&[5f32, 6.0], &Device::Cpu)?)?;

        let saved = record.get("pipe.dit.w").map(|t| t.to_vec1::<f32>()).transpose()?;
        assert_eq!(saved, Some(vec![1.0, 2.0]));
        Ok(())
    }

    #[test]
    fn test_split_rejects_foreign_keys() -> Result<()> {
        let mut tensors = HashMap::new();
        tensors.insert("optimizer.step".to_string(), Tensor::new(&[1f32], &Device::Cpu)?);
        let record = CheckpointRecord::from_tensors(tensors);
        assert!(matches!(record.split(), Err(Error::Checkpoint { .. })));
        Ok(())
    }

    #[test]
    fn test_restore_is_strict() -> Result<()> {
        let vars = vec![("a".to_string(), var(&[0.0, 0.0])?), ("b".to_string(), var(&[0.0])?)];

        // missing key
        let mut only_a = HashMap::new();
        only_a.insert("a".to_string(), Tensor::new(&[1f32, 1.0], &Device::Cpu)?);
        let err = restore_vars("adapter.", &vars, only_a).unwrap_err();
        assert!(matches!(err, Error::Checkpoint { ref key, .. } if key == "adapter.b"));

        // shape mismatch
        let mut wrong_shape = HashMap::new();
        wrong_shape.insert("a".to_string(), Tensor::new(&[1f32, 1.0, 1.0], &Device::Cpu)?);
        wrong_shape.insert("b".to_string(), Tensor::new(&[1f32], &Device::Cpu)?);
        assert!(restore_vars("adapter.", &vars, wrong_shape).is_err());

        // unexpected key
        let mut extra = HashMap::new();
        extra.insert("a".to_string(), Tensor::new(&[1f32, 1.0], &Device::Cpu)?);
        extra.insert("b".to_string(), Tensor::new(&[1f32], &Device::Cpu)?);
        extra.insert("c".to_string(), Tensor::new(&[1f32], &Device::Cpu)?);
        assert!(restore_vars("adapter.", &vars, extra).is_err());

        // nothing was written by the failed restores
        assert_eq!(vars[0].1.to_vec1::<f32>()?, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_file_round_trip_is_bit_identical() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("checkpoint.safetensors");

        let dit = vec![("w".to_string(), Var::randn(0f32, 1f32, (3, 4), &Device::Cpu)?)];
        let adapter = vec![("0.bias".to_string(), Var::randn(0f32, 1f32, 4, &Device::Cpu)?)];
        let record = CheckpointRecord::from_vars(&dit, &adapter)?;
        record.save(&path)?;

        let loaded = CheckpointRecord::load(&path, &Device::Cpu)?;
        assert_eq!(loaded.len(), 2);
        for (key, tensor) in record.tensors() {
            let other = loaded.get(key).expect("key survives round trip");
            let a = tensor.flatten_all()?.to_vec1::<f32>()?;
            let b = other.flatten_all()?.to_vec1::<f32>()?;
            assert!(a.iter().zip(&b).all(|(x, y)| x.to_bits() == y.to_bits()));
        }
        Ok(())
    }
}
