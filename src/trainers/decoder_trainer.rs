//! Epoch loop around `GenerationDecoder`.
//!
//! Draws micro-batches from a `BatchSource`, accumulates gradients, steps the
//! optimizer, logs `train_loss` / `train_learning_rate` and writes a
//! weights-only checkpoint at the end of every epoch.

use log::{info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

use super::batch::{BatchGeometry, BatchSource};
use super::generation_decoder::GenerationDecoder;
use super::optimization::{OptimizationSchedule, OptimizerConfig};
use super::training_helpers::GradientAccumulator;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    /// Micro-batches drawn per epoch; the source is cycled if shorter.
    pub steps_per_epoch: usize,
    pub accumulate_grad_batches: usize,
    pub log_every_n_steps: usize,
    pub output_path: PathBuf,
    pub optimizer: OptimizerConfig,
    /// When set, every drawn batch must match it.
    pub geometry: Option<BatchGeometry>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1,
            steps_per_epoch: 500,
            accumulate_grad_batches: 1,
            log_every_n_steps: 5,
            output_path: PathBuf::from("./"),
            optimizer: OptimizerConfig::default(),
            geometry: None,
        }
    }
}

/// Metrics of one optimizer step.
#[derive(Debug, Clone, Serialize)]
pub struct StepMetrics {
    pub epoch: usize,
    pub step: usize,
    pub train_loss: f32,
    pub train_learning_rate: f64,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub optimizer_steps: usize,
    pub checkpoints: Vec<PathBuf>,
    pub last_loss: Option<f32>,
}

pub struct DecoderTrainer {
    decoder: GenerationDecoder,
    optimization: OptimizationSchedule,
    accumulator: GradientAccumulator,
    config: TrainerConfig,
    history: Vec<StepMetrics>,
}

impl DecoderTrainer {
    pub fn new(decoder: GenerationDecoder, config: TrainerConfig) -> Result<Self> {
        if config.max_epochs == 0 || config.steps_per_epoch == 0 {
            return Err(Error::Config("max_epochs and steps_per_epoch must be positive".to_string()));
        }
        let optimization = OptimizationSchedule::build(decoder.trainable(), config.optimizer)?;
        let accumulator =
            GradientAccumulator::new(decoder.trainable().trainable_vars(), config.accumulate_grad_batches)?;
        if config.steps_per_epoch % config.accumulate_grad_batches != 0 {
            warn!(
                "steps_per_epoch {} is not a multiple of accumulate_grad_batches {}; the remainder is flushed at epoch end",
                config.steps_per_epoch, config.accumulate_grad_batches
            );
        }
        Ok(Self {
            decoder,
            optimization,
            accumulator,
            config,
            history: Vec::new(),
        })
    }

    pub fn decoder(&self) -> &GenerationDecoder {
        &self.decoder
    }

    pub fn history(&self) -> &[StepMetrics] {
        &self.history
    }

    pub fn optimization(&self) -> &OptimizationSchedule {
        &self.optimization
    }

    pub fn fit<S: BatchSource>(&mut self, source: &S) -> Result<TrainingSummary> {
        self.fit_with_rng(source, &mut rand::thread_rng())
    }

    pub fn fit_with_rng<S: BatchSource, R: Rng>(&mut self, source: &S, rng: &mut R) -> Result<TrainingSummary> {
        if source.is_empty() {
            return Err(Error::Config("no training batches found".to_string()));
        }
        let device = self.decoder.context().device.clone();
        let checkpoint_dir = self.config.output_path.join("checkpoints");
        std::fs::create_dir_all(&checkpoint_dir)?;
        let mut metrics_log = std::fs::File::create(self.config.output_path.join("metrics.jsonl"))?;

        info!(
            "Training for {} epochs x {} micro-batches over {} batches",
            self.config.max_epochs,
            self.config.steps_per_epoch,
            source.len()
        );

        let mut checkpoints = Vec::new();
        for epoch in 0..self.config.max_epochs {
            #[cfg(feature = "progress-bar")]
            let progress = epoch_progress_bar(epoch, self.config.steps_per_epoch as u64);

            let mut order: Vec<usize> = (0..source.len()).collect();
            order.shuffle(rng);
            let mut window_loss = Vec::with_capacity(self.config.accumulate_grad_batches);

            for micro_step in 0..self.config.steps_per_epoch {
                let batch = source.get(order[micro_step % order.len()], &device)?;
                if let Some(geometry) = &self.config.geometry {
                    batch.check_geometry(geometry)?;
                }
                let output = self.decoder.training_step_with_rng(&batch, rng)?;
                let scaled = output.loss.affine(self.accumulator.loss_scale(), 0.0)?;
                self.accumulator.accumulate(scaled.backward()?)?;
                window_loss.push(output.loss_value);

                if self.accumulator.is_ready() {
                    self.optimizer_step(epoch, &mut window_loss, &mut metrics_log)?;
                }

                #[cfg(feature = "progress-bar")]
                {
                    progress.set_message(format!("loss {:.4}", output.loss_value));
                    progress.inc(1);
                }
            }
            // Flush a partial accumulation window so no gradient crosses an epoch
            if !window_loss.is_empty() {
                self.optimizer_step(epoch, &mut window_loss, &mut metrics_log)?;
            }

            #[cfg(feature = "progress-bar")]
            progress.finish_and_clear();

            let path = self.save_checkpoint(&checkpoint_dir, epoch)?;
            checkpoints.push(path);
        }

        Ok(TrainingSummary {
            optimizer_steps: self.optimization.step_count(),
            checkpoints,
            last_loss: self.history.last().map(|m| m.train_loss),
        })
    }

    fn optimizer_step(&mut self, epoch: usize, window_loss: &mut Vec<f32>, metrics_log: &mut impl Write) -> Result<()> {
        let Some(grads) = self.accumulator.take() else {
            return Ok(());
        };
        let learning_rate = self.optimization.current_lr();
        self.optimization.step(grads)?;

        let train_loss = window_loss.iter().sum::<f32>() / window_loss.len().max(1) as f32;
        window_loss.clear();
        let metrics = StepMetrics {
            epoch,
            step: self.optimization.step_count(),
            train_loss,
            train_learning_rate: learning_rate,
        };
        if metrics.step % self.config.log_every_n_steps.max(1) == 0 {
            info!(
                "step {} | train_loss {:.6} | train_learning_rate {:e}",
                metrics.step, metrics.train_loss, metrics.train_learning_rate
            );
            writeln!(metrics_log, "{}", serde_json::to_string(&metrics)?)?;
        }
        self.history.push(metrics);
        Ok(())
    }

    fn save_checkpoint(&self, dir: &Path, epoch: usize) -> Result<PathBuf> {
        let path = dir.join(format!(
            "epoch={}-step={}.safetensors",
            epoch,
            self.optimization.step_count()
        ));
        self.decoder.state_record()?.save(&path)?;
        Ok(path)
    }
}

#[cfg(feature = "progress-bar")]
fn epoch_progress_bar(epoch: usize, len: u64) -> ProgressBar {
    let progress = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar().template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
        progress.set_style(style.progress_chars("=>-"));
    }
    progress.set_prefix(format!("epoch {}", epoch));
    progress
}
