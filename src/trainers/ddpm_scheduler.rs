//! DDPM noise scheduler for noise- and velocity-prediction backbones
//! Implements the discrete variance-preserving forward process

use candle_core::Tensor;

use super::noise_scheduler::NoiseScheduler;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredcosCapV2,
}

/// What the backbone regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    prediction_type: PredictionType,
    min_snr_gamma: Option<f64>,
    timesteps: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl DdpmScheduler {
    pub fn new(
        num_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        beta_schedule: BetaSchedule,
        prediction_type: PredictionType,
        min_snr_gamma: Option<f64>,
    ) -> Result<Self> {
        if num_timesteps == 0 {
            return Err(Error::Config("num_train_timesteps must be positive".to_string()));
        }
        if let Some(gamma) = min_snr_gamma {
            if gamma <= 0.0 {
                return Err(Error::Config(format!("min_snr_gamma must be positive, got {}", gamma)));
            }
        }

        let betas = match beta_schedule {
            BetaSchedule::Linear => Self::linear_beta_schedule(num_timesteps, beta_start, beta_end),
            BetaSchedule::ScaledLinear => Self::scaled_linear_beta_schedule(num_timesteps, beta_start, beta_end),
            BetaSchedule::SquaredcosCapV2 => Self::cosine_beta_schedule(num_timesteps),
        };

        let mut alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut running = 1.0;
        for beta in betas {
            running *= 1.0 - beta;
            alphas_cumprod.push(running);
        }

        Ok(Self {
            prediction_type,
            min_snr_gamma,
            timesteps: (0..num_timesteps).map(|t| t as f64).collect(),
            alphas_cumprod,
        })
    }

    /// Stable Diffusion defaults: scaled-linear betas from 0.00085 to 0.012.
    pub fn stable_diffusion(num_timesteps: usize, prediction_type: PredictionType) -> Result<Self> {
        Self::new(num_timesteps, 0.00085, 0.012, BetaSchedule::ScaledLinear, prediction_type, None)
    }

    pub fn with_min_snr_gamma(mut self, gamma: f64) -> Result<Self> {
        if gamma <= 0.0 {
            return Err(Error::Config(format!("min_snr_gamma must be positive, got {}", gamma)));
        }
        self.min_snr_gamma = Some(gamma);
        Ok(self)
    }

    fn alpha_cumprod(&self, timestep: f64) -> f64 {
        let last = self.alphas_cumprod.len() - 1;
        let idx = (timestep.round().max(0.0) as usize).min(last);
        self.alphas_cumprod[idx]
    }

    /// Signal-to-noise ratio at `timestep`.
    pub fn snr(&self, timestep: f64) -> f64 {
        let alpha = self.alpha_cumprod(timestep);
        alpha / (1.0 - alpha)
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    // Beta schedule functions
    fn linear_beta_schedule(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
        let denom = (num_timesteps.max(2) - 1) as f64;
        (0..num_timesteps)
            .map(|i| beta_start + (beta_end - beta_start) * i as f64 / denom)
            .collect()
    }

    fn scaled_linear_beta_schedule(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        let denom = (num_timesteps.max(2) - 1) as f64;
        (0..num_timesteps)
            .map(|i| {
                let t = start + (end - start) * i as f64 / denom;
                t * t
            })
            .collect()
    }

    fn cosine_beta_schedule(num_timesteps: usize) -> Vec<f64> {
        let s = 0.008;
        let alpha_bar = |t: f64| ((t + s) / (1.0 + s) * std::f64::consts::FRAC_PI_2).cos().powi(2);
        let alpha_0 = alpha_bar(0.0);
        (0..num_timesteps)
            .map(|i| {
                let t1 = i as f64 / num_timesteps as f64;
                let t2 = (i + 1) as f64 / num_timesteps as f64;
                (1.0 - (alpha_bar(t2) / alpha_0) / (alpha_bar(t1) / alpha_0)).min(0.999)
            })
            .collect()
    }
}

impl NoiseScheduler for DdpmScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.timesteps.len()
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    /// noisy = sqrt(alpha_bar) * original + sqrt(1 - alpha_bar) * noise
    fn add_noise(&self, latents: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        let alpha = self.alpha_cumprod(timestep);
        Ok((latents.affine(alpha.sqrt(), 0.0)? + noise.affine((1.0 - alpha).sqrt(), 0.0)?)?)
    }

    fn training_target(&self, latents: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        match self.prediction_type {
            PredictionType::Epsilon => Ok(noise.clone()),
            PredictionType::VPrediction => {
                // v = sqrt(alpha_bar) * noise - sqrt(1 - alpha_bar) * sample
                let alpha = self.alpha_cumprod(timestep);
                Ok((noise.affine(alpha.sqrt(), 0.0)? - latents.affine((1.0 - alpha).sqrt(), 0.0)?)?)
            }
        }
    }

    /// Min-SNR-gamma weighting, or 1.0 without a gamma.
    fn training_weight(&self, timestep: f64) -> Result<f64> {
        let Some(gamma) = self.min_snr_gamma else {
            return Ok(1.0);
        };
        let snr = self.snr(timestep);
        let clipped = snr.min(gamma);
        Ok(match self.prediction_type {
            PredictionType::Epsilon => clipped / snr,
            PredictionType::VPrediction => clipped / (snr + 1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_alphas_cumprod_decrease() -> Result<()> {
        for schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear, BetaSchedule::SquaredcosCapV2] {
            let scheduler = DdpmScheduler::new(1000, 0.0001, 0.02, schedule, PredictionType::Epsilon, None)?;
            assert!(scheduler.alphas_cumprod.windows(2).all(|w| w[1] < w[0]));
            assert!(scheduler.alphas_cumprod[999] > 0.0);
            assert_eq!(scheduler.timestep_range(), (0.0, 999.0));
        }
        Ok(())
    }

    #[test]
    fn test_epsilon_target_is_noise() -> Result<()> {
        let scheduler = DdpmScheduler::stable_diffusion(1000, PredictionType::Epsilon)?;
        let latents = Tensor::ones((1, 4, 2, 2), candle_core::DType::F32, &Device::Cpu)?;
        let noise = Tensor::randn(0f32, 1f32, (1, 4, 2, 2), &Device::Cpu)?;
        let target = scheduler.training_target(&latents, &noise, 500.0)?;
        assert_eq!(
            target.flatten_all()?.to_vec1::<f32>()?,
            noise.flatten_all()?.to_vec1::<f32>()?
        );
        assert_eq!(scheduler.training_weight(500.0)?, 1.0);
        Ok(())
    }

    #[test]
    fn test_add_noise_preserves_variance_split() -> Result<()> {
        let scheduler = DdpmScheduler::stable_diffusion(1000, PredictionType::VPrediction)?;
        let latents = Tensor::ones((1, 1, 1, 1), candle_core::DType::F32, &Device::Cpu)?;
        let zeros = latents.zeros_like()?;

        let t = 250.0;
        let signal: f32 = scheduler.add_noise(&latents, &zeros, t)?.flatten_all()?.to_vec1::<f32>()?[0];
        let noise_part: f32 = scheduler.add_noise(&zeros, &latents, t)?.flatten_all()?.to_vec1::<f32>()?[0];
        let total = signal * signal + noise_part * noise_part;
        assert!((total - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_min_snr_weight_caps_low_noise_steps() -> Result<()> {
        let scheduler = DdpmScheduler::stable_diffusion(1000, PredictionType::Epsilon)?.with_min_snr_gamma(5.0)?;
        // Early timesteps have huge SNR, so the weight drops below one
        assert!(scheduler.training_weight(1.0)? < 1.0);
        // Late timesteps have SNR below gamma
        assert_eq!(scheduler.training_weight(999.0)?, 1.0);
        Ok(())
    }
}
