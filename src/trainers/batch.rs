//! Pre-encoded training batches.

use candle_core::{Device, Tensor};
use log::debug;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Spatial downsampling of the Flux autoencoder.
pub const LATENT_SCALE: usize = 8;

/// Batch size and pixel resolution every batch must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchGeometry {
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
}

/// One batch as seen by the training step.
///
/// `embed` is required. At least one of `latents` or `image` must be present;
/// `latents` wins when both are.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// External embeddings, (batch, sequence, in_channels).
    pub embed: Tensor,
    /// Pixels in [-1, 1], (batch, 3, height, width).
    pub image: Option<Tensor>,
    /// Pre-encoded latents, (batch, channels, h, w).
    pub latents: Option<Tensor>,
}

impl TrainingBatch {
    pub fn with_latents(embed: Tensor, latents: Tensor) -> Self {
        Self {
            embed,
            image: None,
            latents: Some(latents),
        }
    }

    pub fn with_image(embed: Tensor, image: Tensor) -> Self {
        Self {
            embed,
            image: Some(image),
            latents: None,
        }
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.embed.dim(0)?)
    }

    /// Fail unless the batch has the configured size and resolution. Latents
    /// are checked at `1 / LATENT_SCALE` of the pixel resolution.
    pub fn check_geometry(&self, geometry: &BatchGeometry) -> Result<()> {
        if self.batch_size()? != geometry.batch_size {
            return Err(Error::shape(
                "embed",
                format!("batch of {}", geometry.batch_size),
                self.embed.dims(),
            ));
        }
        let (name, tensor, scale) = match (&self.latents, &self.image) {
            (Some(latents), _) => ("latents", latents, LATENT_SCALE),
            (None, Some(image)) => ("image", image, 1),
            (None, None) => return Err(Error::MissingBatchField("latents")),
        };
        let (height, width) = (geometry.height / scale, geometry.width / scale);
        let expected = format!("(batch, channels, {}, {})", height, width);
        let (_, _, h, w) = tensor.dims4().map_err(|_| Error::shape(name, expected.clone(), tensor.dims()))?;
        if h != height || w != width {
            return Err(Error::shape(name, expected, tensor.dims()));
        }
        Ok(())
    }

    /// Read a batch file holding `embed` plus `latents` and/or `image`.
    pub fn from_safetensors(path: &Path, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let embed = tensors.remove("embed").ok_or(Error::MissingBatchField("embed"))?;
        let batch = Self {
            embed,
            image: tensors.remove("image"),
            latents: tensors.remove("latents"),
        };
        if batch.image.is_none() && batch.latents.is_none() {
            return Err(Error::MissingBatchField("latents"));
        }
        debug!("loaded batch {} with embed {:?}", path.display(), batch.embed.dims());
        Ok(batch)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = std::collections::HashMap::new();
        tensors.insert("embed".to_string(), self.embed.clone());
        if let Some(image) = &self.image {
            tensors.insert("image".to_string(), image.clone());
        }
        if let Some(latents) = &self.latents {
            tensors.insert("latents".to_string(), latents.clone());
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }
}

/// Anything the trainer can draw batches from by index.
pub trait BatchSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize, device: &Device) -> Result<TrainingBatch>;
}

impl BatchSource for Vec<TrainingBatch> {
    fn len(&self) -> usize {
        <[TrainingBatch]>::len(self)
    }

    fn get(&self, index: usize, device: &Device) -> Result<TrainingBatch> {
        let batch = self
            .as_slice()
            .get(index)
            .ok_or_else(|| Error::Config(format!("batch index {} out of range", index)))?;
        Ok(TrainingBatch {
            embed: batch.embed.to_device(device)?,
            image: batch.image.as_ref().map(|t| t.to_device(device)).transpose()?,
            latents: batch.latents.as_ref().map(|t| t.to_device(device)).transpose()?,
        })
    }
}

/// Batch files (`*.safetensors`) of a directory, in file-name order.
#[derive(Debug, Clone)]
pub struct BatchDir {
    files: Vec<PathBuf>,
}

impl BatchDir {
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Config(format!("dataset directory not found: {}", dir.display())));
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
                files.push(path);
            }
        }
        files.sort();
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl BatchSource for BatchDir {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize, device: &Device) -> Result<TrainingBatch> {
        let path = self
            .files
            .get(index)
            .ok_or_else(|| Error::Config(format!("batch index {} out of range", index)))?;
        TrainingBatch::from_safetensors(path, device)
    }
}
