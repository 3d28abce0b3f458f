//! Training-time noise schedules.
//!
//! A scheduler owns the diffusion parameterization: how a clean latent is
//! noised at a timestep, what the backbone should regress, and how much that
//! timestep's loss counts. The step orchestrator only talks to the trait, so
//! swapping flow matching for DDPM never touches the training step.

use candle_core::Tensor;

use crate::error::{Error, Result};

pub trait NoiseScheduler: Send + Sync {
    fn num_train_timesteps(&self) -> usize;

    /// Ordered timetable; a sampled index resolves to `timesteps()[index]`.
    fn timesteps(&self) -> &[f64];

    fn add_noise(&self, latents: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor>;

    fn training_target(&self, latents: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor>;

    fn training_weight(&self, timestep: f64) -> Result<f64>;

    /// Smallest and largest timetable value.
    fn timestep_range(&self) -> (f64, f64) {
        self.timesteps()
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &t| (lo.min(t), hi.max(t)))
    }
}

/// Index of the timetable entry closest to `timestep`.
pub(crate) fn nearest_index(timesteps: &[f64], timestep: f64) -> usize {
    timesteps
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - timestep)
                .abs()
                .partial_cmp(&(*b - timestep).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Rectified-flow scheduler used by Flux.
///
/// `x_t = (1 - sigma) * x_0 + sigma * noise`, target `noise - x_0`.
#[derive(Debug, Clone)]
pub struct FlowMatchScheduler {
    num_train_timesteps: usize,
    shift: f64,
    sigma_min: f64,
    sigma_max: f64,
    sigmas: Vec<f64>,
    timesteps: Vec<f64>,
    weights: Vec<f64>,
}

impl FlowMatchScheduler {
    pub const DEFAULT_SHIFT: f64 = 3.0;
    pub const DEFAULT_SIGMA_MIN: f64 = 0.003 / 1.002;
    pub const DEFAULT_SIGMA_MAX: f64 = 1.0;

    pub fn new(num_train_timesteps: usize) -> Result<Self> {
        Self::with_shift(
            num_train_timesteps,
            Self::DEFAULT_SHIFT,
            Self::DEFAULT_SIGMA_MIN,
            Self::DEFAULT_SIGMA_MAX,
        )
    }

    pub fn with_shift(num_train_timesteps: usize, shift: f64, sigma_min: f64, sigma_max: f64) -> Result<Self> {
        if num_train_timesteps == 0 {
            return Err(Error::Config("num_train_timesteps must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&sigma_min) || !(sigma_min..=1.0).contains(&sigma_max) {
            return Err(Error::Config(format!(
                "invalid sigma range [{}, {}]",
                sigma_min, sigma_max
            )));
        }
        let mut scheduler = Self {
            num_train_timesteps,
            shift,
            sigma_min,
            sigma_max,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
            weights: Vec::new(),
        };
        scheduler.set_training_timesteps();
        Ok(scheduler)
    }

    /// Lay out the full training timetable and its loss weights.
    fn set_training_timesteps(&mut self) {
        let n = self.num_train_timesteps;
        let step = if n > 1 {
            (self.sigma_min - self.sigma_max) / (n - 1) as f64
        } else {
            0.0
        };
        self.sigmas = (0..n)
            .map(|i| {
                let sigma = self.sigma_max + step * i as f64;
                self.shift * sigma / (1.0 + (self.shift - 1.0) * sigma)
            })
            .collect();
        self.timesteps = self
            .sigmas
            .iter()
            .map(|s| s * self.num_train_timesteps as f64)
            .collect();

        // Gaussian bump centred on the middle of the timetable
        let half = n as f64 / 2.0;
        let bump: Vec<f64> = self
            .timesteps
            .iter()
            .map(|t| (-2.0 * ((t - half) / n as f64).powi(2)).exp())
            .collect();
        let min = bump.iter().cloned().fold(f64::INFINITY, f64::min);
        let shifted: Vec<f64> = bump.iter().map(|y| y - min).collect();
        let total: f64 = shifted.iter().sum();
        self.weights = if total > 0.0 {
            shifted.iter().map(|y| y * n as f64 / total).collect()
        } else {
            vec![1.0; n]
        };
    }

    pub fn sigma(&self, timestep: f64) -> f64 {
        self.sigmas[nearest_index(&self.timesteps, timestep)]
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }
}

impl NoiseScheduler for FlowMatchScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.num_train_timesteps
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn add_noise(&self, latents: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        let sigma = self.sigma(timestep);
        Ok((latents.affine(1.0 - sigma, 0.0)? + noise.affine(sigma, 0.0)?)?)
    }

    fn training_target(&self, latents: &Tensor, noise: &Tensor, _timestep: f64) -> Result<Tensor> {
        Ok((noise - latents)?)
    }

    fn training_weight(&self, timestep: f64) -> Result<f64> {
        Ok(self.weights[nearest_index(&self.timesteps, timestep)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_timetable_is_monotonic_and_shifted() -> Result<()> {
        let scheduler = FlowMatchScheduler::new(1000)?;
        let timesteps = scheduler.timesteps();
        assert_eq!(timesteps.len(), 1000);
        assert!((timesteps[0] - 1000.0).abs() < 1e-9);
        assert!(timesteps.windows(2).all(|w| w[0] > w[1]));

        // shift > 1 pushes sigmas towards the noisy end
        let mid = scheduler.sigmas()[500];
        assert!(mid > 0.5);
        let (lo, hi) = scheduler.timestep_range();
        assert!(lo > 0.0 && hi <= 1000.0);
        Ok(())
    }

    #[test]
    fn test_weights_average_to_one() -> Result<()> {
        let scheduler = FlowMatchScheduler::new(1000)?;
        let total: f64 = scheduler
            .timesteps()
            .iter()
            .map(|&t| scheduler.training_weight(t))
            .sum::<Result<f64>>()?;
        assert!((total / 1000.0 - 1.0).abs() < 1e-9);

        // weight peaks near the middle of the timetable
        let near_mid = scheduler.training_weight(500.0)?;
        let near_end = scheduler.training_weight(999.0)?;
        assert!(near_mid > near_end);
        Ok(())
    }

    #[test]
    fn test_add_noise_interpolates() -> Result<()> {
        let scheduler = FlowMatchScheduler::new(10)?;
        let device = Device::Cpu;
        let latents = Tensor::full(2f32, (1, 2, 2, 2), &device)?;
        let noise = Tensor::full(-1f32, (1, 2, 2, 2), &device)?;

        let t = scheduler.timesteps()[3];
        let sigma = scheduler.sigma(t);
        let noisy = scheduler.add_noise(&latents, &noise, t)?;
        let expected = (1.0 - sigma) * 2.0 - sigma;
        let values = noisy.flatten_all()?.to_vec1::<f32>()?;
        for v in values {
            assert!((v as f64 - expected).abs() < 1e-5);
        }

        let target = scheduler.training_target(&latents, &noise, t)?;
        assert_eq!(target.flatten_all()?.to_vec1::<f32>()?, vec![-3.0; 8]);
        assert_eq!(target.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_zero_timesteps_rejected() {
        assert!(matches!(FlowMatchScheduler::new(0), Err(Error::Config(_))));
    }
}
