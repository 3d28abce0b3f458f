//! AdamW over the trainable state with a linear-warmup constant schedule.
//!
//! Half-precision vars are optimized through f32 master copies: AdamW's `eps`
//! and a small learning-rate update both vanish in f16.

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::info;

use super::freeze::TrainableState;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub warmup_steps: usize,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    pub fn new(learning_rate: f64, warmup_steps: usize) -> Self {
        Self {
            learning_rate,
            warmup_steps,
            ..Default::default()
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            warmup_steps: 1,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Linear ramp from 0 to `base_lr` over `warmup_steps`, then constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantWithWarmup {
    pub base_lr: f64,
    pub warmup_steps: usize,
}

impl ConstantWithWarmup {
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            self.base_lr * step as f64 / self.warmup_steps.max(1) as f64
        } else {
            self.base_lr
        }
    }
}

/// A half-precision trainable var and the f32 copy AdamW updates.
struct MasterCopy {
    param: Var,
    master: Var,
}

/// Optimizer plus the schedule that drives its learning rate.
///
/// The schedule advances once per optimizer step, not per micro-batch.
pub struct OptimizationSchedule {
    optimizer: AdamW,
    masters: Vec<MasterCopy>,
    schedule: ConstantWithWarmup,
    step: usize,
}

impl OptimizationSchedule {
    pub fn build(trainable: &TrainableState, config: OptimizerConfig) -> Result<Self> {
        if !(config.learning_rate.is_finite() && config.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                config.learning_rate
            )));
        }
        let schedule = ConstantWithWarmup {
            base_lr: config.learning_rate,
            warmup_steps: config.warmup_steps,
        };
        let mut vars = Vec::new();
        let mut masters = Vec::new();
        for param in trainable.trainable_vars() {
            if matches!(param.dtype(), DType::F32 | DType::F64) {
                vars.push(param);
            } else {
                let master = Var::from_tensor(&param.as_tensor().to_dtype(DType::F32)?)?;
                vars.push(master.clone());
                masters.push(MasterCopy { param, master });
            }
        }
        info!(
            "AdamW over {} tensors ({} via f32 master copies), lr {:e}, {} warmup steps",
            vars.len(),
            masters.len(),
            config.learning_rate,
            config.warmup_steps
        );
        let optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: schedule.lr_at(0),
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.eps,
                weight_decay: config.weight_decay,
            },
        )?;
        Ok(Self {
            optimizer,
            masters,
            schedule,
            step: 0,
        })
    }

    /// Apply `grads` at the current rate, then advance the schedule.
    pub fn step(&mut self, mut grads: GradStore) -> Result<()> {
        for copy in &self.masters {
            if let Some(grad) = grads.remove(&copy.param) {
                grads.insert(&copy.master, grad.to_dtype(DType::F32)?);
            }
        }
        self.optimizer.step(&grads)?;
        for copy in &self.masters {
            copy.param.set(&copy.master.as_tensor().to_dtype(copy.param.dtype())?)?;
        }
        self.step += 1;
        self.optimizer.set_learning_rate(self.schedule.lr_at(self.step));
        Ok(())
    }

    pub fn current_lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Optimizer steps taken so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn schedule(&self) -> &ConstantWithWarmup {
        &self.schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn test_warmup_ramps_then_holds() {
        let schedule = ConstantWithWarmup {
            base_lr: 1e-4,
            warmup_steps: 10,
        };
        assert!(schedule.lr_at(0) < 1e-4);
        let ramp: Vec<f64> = (0..=10).map(|s| schedule.lr_at(s)).collect();
        assert!(ramp.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(schedule.lr_at(10), 1e-4);
        assert_eq!(schedule.lr_at(10_000), 1e-4);
    }

    #[test]
    fn test_no_warmup_starts_at_target() {
        let schedule = ConstantWithWarmup {
            base_lr: 1e-5,
            warmup_steps: 0,
        };
        assert_eq!(schedule.lr_at(0), 1e-5);
    }

    #[test]
    fn test_step_advances_rate() -> Result<()> {
        let weight = Var::from_tensor(&Tensor::new(&[1f32, -1.0], &Device::Cpu)?)?;
        let trainable = TrainableState::new(vec![("w".to_string(), weight.clone())], vec![])?;
        let mut opt = OptimizationSchedule::build(&trainable, OptimizerConfig::new(1e-2, 2))?;
        assert_eq!(opt.current_lr(), 0.0);

        let loss = weight.as_tensor().sqr()?.sum_all()?;
        opt.step(loss.backward()?)?;
        assert_eq!(opt.step_count(), 1);
        assert_eq!(opt.current_lr(), 5e-3);

        let loss = weight.as_tensor().sqr()?.sum_all()?;
        opt.step(loss.backward()?)?;
        assert_eq!(opt.current_lr(), 1e-2);

        // the second step ran at a non-zero rate
        let values = weight.to_vec1::<f32>()?;
        assert!(values[0] < 1.0 && values[1] > -1.0);
        Ok(())
    }

    #[test]
    fn test_half_precision_step_stays_finite() -> Result<()> {
        let weight = Var::from_tensor(&Tensor::new(&[1f32, -1.0, 0.5], &Device::Cpu)?.to_dtype(DType::F16)?)?;
        let trainable = TrainableState::new(vec![("w".to_string(), weight.clone())], vec![])?;
        let mut opt = OptimizationSchedule::build(&trainable, OptimizerConfig::new(1e-2, 0))?;

        // middle element gets an exactly-zero gradient
        let mask = Tensor::new(&[1f32, 0.0, 1.0], &Device::Cpu)?.to_dtype(DType::F16)?;
        let loss = weight.as_tensor().mul(&mask)?.sum_all()?;
        opt.step(loss.backward()?)?;

        assert_eq!(weight.dtype(), DType::F16);
        let values = weight.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()), "{:?}", values);
        assert!(values[0] < 1.0 && values[2] < 0.5);
        assert!((values[1] + 1.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_non_positive_rate_rejected() -> Result<()> {
        let trainable = TrainableState::new(vec![], vec![])?;
        assert!(OptimizationSchedule::build(&trainable, OptimizerConfig::new(0.0, 1)).is_err());
        Ok(())
    }
}
