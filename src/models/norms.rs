//! Normalization layers built from primitive tensor ops.
//!
//! candle's fused `layer_norm`/`rms_norm` kernels carry no backward pass, so
//! any norm sitting between a trainable weight and the loss is composed here
//! from ops that do. Half-precision inputs are normalized in f32.

use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Init, VarBuilder};

fn internal_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F16 | DType::BF16 => DType::F32,
        other => other,
    }
}

/// `(x - mean) / sqrt(var + eps)` over the last dimension.
pub fn normalize(xs: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    let dtype = xs.dtype();
    let xs = xs.to_dtype(internal_dtype(dtype))?;
    let mean = xs.mean_keepdim(D::Minus1)?;
    let centered = xs.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    centered.broadcast_div(&(var + eps)?.sqrt()?)?.to_dtype(dtype)
}

/// `x / sqrt(mean(x^2) + eps) * scale` over the last dimension.
pub fn rms_norm(xs: &Tensor, scale: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    let dtype = xs.dtype();
    let xs = xs.to_dtype(internal_dtype(dtype))?;
    let rms = (xs.sqr()?.mean_keepdim(D::Minus1)? + eps)?.sqrt()?;
    xs.broadcast_div(&rms)?.to_dtype(dtype)?.broadcast_mul(scale)
}

/// LayerNorm with optional learned affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    eps: f64,
}

impl LayerNorm {
    /// Learned `weight` (ones) and `bias` (zeros) under `vb`.
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            weight: Some(vb.get_with_hints(dim, "weight", Init::Const(1.0))?),
            bias: Some(vb.get_with_hints(dim, "bias", Init::Const(0.0))?),
            eps,
        })
    }

    /// No parameters; Flux stores none for its pre-modulation norms.
    pub fn plain(eps: f64) -> Self {
        Self {
            weight: None,
            bias: None,
            eps,
        }
    }

    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = normalize(xs, self.eps)?;
        if let Some(weight) = &self.weight {
            xs = xs.broadcast_mul(weight)?;
        }
        if let Some(bias) = &self.bias {
            xs = xs.broadcast_add(bias)?;
        }
        Ok(xs)
    }
}

#[derive(Debug, Clone)]
pub struct RmsNorm {
    scale: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(dim: usize, eps: f64, name: &str, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            scale: vb.get_with_hints(dim, name, Init::Const(1.0))?,
            eps,
        })
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        rms_norm(xs, &self.scale, self.eps)
    }
}
