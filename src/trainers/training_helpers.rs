//! Training helper structs and utilities

use candle_core::backprop::GradStore;
use candle_core::Var;

use crate::error::{Error, Result};

/// Gradient accumulation helper
///
/// Sums the gradients of the tracked vars over `steps` micro-batches. Losses
/// are expected to be pre-scaled by `1 / steps`. The first store of a window
/// becomes the accumulator; later ones are added into it.
pub struct GradientAccumulator {
    vars: Vec<Var>,
    steps: usize,
    seen: usize,
    accumulated: Option<GradStore>,
}

impl GradientAccumulator {
    pub fn new(vars: Vec<Var>, steps: usize) -> Result<Self> {
        if steps == 0 {
            return Err(Error::Config("accumulate_grad_batches must be positive".to_string()));
        }
        Ok(Self {
            vars,
            steps,
            seen: 0,
            accumulated: None,
        })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Micro-batch scale for the loss.
    pub fn loss_scale(&self) -> f64 {
        1.0 / self.steps as f64
    }

    pub fn accumulate(&mut self, mut grads: GradStore) -> Result<()> {
        if let Some(accumulated) = self.accumulated.as_mut() {
            for var in &self.vars {
                let Some(grad) = grads.remove(var) else {
                    continue;
                };
                let sum = match accumulated.remove(var) {
                    Some(prev) => (prev + grad)?,
                    None => grad,
                };
                accumulated.insert(var, sum);
            }
        } else {
            self.accumulated = Some(grads);
        }
        self.seen += 1;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.seen >= self.steps
    }

    /// Accumulated gradients, or `None` when nothing was accumulated.
    pub fn take(&mut self) -> Option<GradStore> {
        if self.seen == 0 {
            return None;
        }
        self.seen = 0;
        self.accumulated.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn test_gradients_sum_over_micro_batches() -> Result<()> {
        let w = Var::from_tensor(&Tensor::new(&[2f32], &Device::Cpu)?)?;
        let mut acc = GradientAccumulator::new(vec![w.clone()], 2)?;

        for _ in 0..2 {
            assert!(!acc.is_ready());
            // d/dw (0.5 * w^2) = 0.5 * 2w
            let loss = w.as_tensor().sqr()?.sum_all()?.affine(acc.loss_scale(), 0.0)?;
            acc.accumulate(loss.backward()?)?;
        }
        assert!(acc.is_ready());

        let grads = acc.take().expect("two micro-batches accumulated");
        let grad = grads.get(&w).map(|g| g.to_vec1::<f32>()).transpose()?;
        assert_eq!(grad, Some(vec![4.0]));
        assert!(acc.take().is_none());
        Ok(())
    }

    #[test]
    fn test_zero_steps_rejected() {
        assert!(GradientAccumulator::new(vec![], 0).is_err());
    }
}
