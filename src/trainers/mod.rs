pub mod batch;
pub mod checkpoint;
pub mod ddpm_scheduler;
pub mod decoder_trainer;
pub mod freeze;
pub mod generation_decoder;
pub mod noise_scheduler;
pub mod optimization;
pub mod training_helpers;

// Re-export key types
pub use batch::{BatchDir, BatchGeometry, BatchSource, TrainingBatch};
pub use checkpoint::{CheckpointRecord, ADAPTER_PREFIX, DIT_PREFIX};
pub use decoder_trainer::{DecoderTrainer, StepMetrics, TrainerConfig, TrainingSummary};
pub use freeze::{Component, ComponentMode, FreezePolicy, TrainableState};
pub use generation_decoder::{GenerationDecoder, GenerationDecoderConfig, StepDraws, StepOutput};
pub use noise_scheduler::{FlowMatchScheduler, NoiseScheduler};
pub use optimization::{ConstantWithWarmup, OptimizationSchedule, OptimizerConfig};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::loaders::{load_flux_pipeline, LoadOptions, PresetLora, PretrainedWeights};
use crate::models::conditioning::StepContext;
use crate::models::embed_adapter::EmbedAdapterConfig;

/// Numeric precision of activations and trainable weights.
///
/// `16-mixed` runs the frozen encoders in f16 but keeps every trainable
/// weight, and the DiT computation on it, in f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "32")]
    Full,
    #[serde(rename = "16")]
    Half,
    #[serde(rename = "16-mixed")]
    HalfMixed,
    #[serde(rename = "bf16")]
    BFloat16,
}

impl Precision {
    /// Activation dtype of a step.
    pub fn dtype(self) -> DType {
        match self {
            Precision::Full => DType::F32,
            Precision::Half | Precision::HalfMixed => DType::F16,
            Precision::BFloat16 => DType::BF16,
        }
    }

    /// Storage dtype of the trainable weights.
    pub fn param_dtype(self) -> DType {
        match self {
            Precision::Full | Precision::HalfMixed => DType::F32,
            Precision::Half => DType::F16,
            Precision::BFloat16 => DType::BF16,
        }
    }
}

fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "float32" | "f32" => Ok(DType::F32),
        "float16" | "f16" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        other => anyhow::bail!("unsupported quantize dtype `{}` (expected float32, float16 or bfloat16)", other),
    }
}

fn default_output_path() -> PathBuf {
    PathBuf::from("./")
}
fn default_resolution() -> usize {
    1024
}
fn default_one() -> usize {
    1
}
fn default_precision() -> Precision {
    Precision::HalfMixed
}
fn default_learning_rate() -> f64 {
    1e-5
}
fn default_steps_per_epoch() -> usize {
    500
}
fn default_in_channel() -> usize {
    3584
}
fn default_out_channel() -> usize {
    4096
}
fn default_guidance() -> f64 {
    generation_decoder::DEFAULT_GUIDANCE
}
fn default_num_train_timesteps() -> usize {
    1000
}
fn default_device() -> String {
    "cuda".to_string()
}
fn default_log_every_n_steps() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Directory of pre-encoded `*.safetensors` batches.
    pub dataset_path: PathBuf,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default = "default_resolution")]
    pub height: usize,
    #[serde(default = "default_resolution")]
    pub width: usize,
    #[serde(default = "default_one")]
    pub batch_size: usize,
    #[serde(default = "default_precision")]
    pub precision: Precision,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_one")]
    pub lr_warmup_steps: usize,
    #[serde(default = "default_one")]
    pub accumulate_grad_batches: usize,
    #[serde(default = "default_one")]
    pub max_epochs: usize,
    #[serde(default = "default_steps_per_epoch")]
    pub steps_per_epoch: usize,
    #[serde(default)]
    pub use_gradient_checkpointing: bool,

    pub pretrained_dit_path: PathBuf,
    pub pretrained_text_encoder_path: PathBuf,
    #[serde(default)]
    pub pretrained_vae_path: Option<PathBuf>,
    pub tokenizer_path: PathBuf,
    /// Prior checkpoint to restore; `"none"` means start fresh.
    #[serde(default)]
    pub load_from: Option<String>,
    #[serde(default)]
    pub preset_lora_path: Option<PathBuf>,
    #[serde(default)]
    pub preset_lora_alpha: Option<f64>,
    /// DiT storage dtype override.
    #[serde(default)]
    pub quantize: Option<String>,

    #[serde(default = "default_in_channel")]
    pub in_channel: usize,
    #[serde(default = "default_out_channel")]
    pub out_channel: usize,
    #[serde(default = "default_one")]
    pub expand_ratio: usize,
    #[serde(default = "default_guidance")]
    pub guidance: f64,
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
}

impl DecoderConfig {
    pub fn load_from_path(&self) -> Option<PathBuf> {
        match self.load_from.as_deref() {
            None | Some("none") | Some("") => None,
            Some(path) => Some(PathBuf::from(path)),
        }
    }

    pub fn adapter(&self) -> EmbedAdapterConfig {
        EmbedAdapterConfig {
            in_channels: self.in_channel,
            out_channels: self.out_channel,
            expand_ratio: self.expand_ratio,
        }
    }

    pub fn trainer(&self) -> TrainerConfig {
        TrainerConfig {
            max_epochs: self.max_epochs,
            steps_per_epoch: self.steps_per_epoch,
            accumulate_grad_batches: self.accumulate_grad_batches,
            log_every_n_steps: self.log_every_n_steps,
            output_path: self.output_path.clone(),
            optimizer: OptimizerConfig::new(self.learning_rate, self.lr_warmup_steps),
            geometry: Some(BatchGeometry {
                batch_size: self.batch_size,
                height: self.height,
                width: self.width,
            }),
        }
    }

    pub fn weights(&self) -> PretrainedWeights {
        PretrainedWeights {
            dit: self.pretrained_dit_path.clone(),
            text_encoder: self.pretrained_text_encoder_path.clone(),
            vae: self.pretrained_vae_path.clone(),
            tokenizer: self.tokenizer_path.clone(),
        }
    }

    pub fn load_options(&self) -> Result<LoadOptions> {
        Ok(LoadOptions {
            dit_dtype: self.quantize.as_deref().map(parse_dtype).transpose()?,
            preset_lora: self.preset_lora_path.clone().map(|path| PresetLora {
                path,
                alpha: self.preset_lora_alpha,
            }),
            num_train_timesteps: self.num_train_timesteps,
            param_dtype: self.precision.param_dtype(),
            ..Default::default()
        })
    }
}

pub fn load_config(path: &Path) -> Result<DecoderConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: DecoderConfig = serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}

/// `"cpu"`, `"cuda"` or `"cuda:N"`.
pub fn parse_device(name: &str) -> Result<Device> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0).context("Failed to open CUDA device 0"),
        other => {
            let ordinal = other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<usize>().ok())
                .with_context(|| format!("Unknown device `{}`", other))?;
            Device::new_cuda(ordinal).with_context(|| format!("Failed to open CUDA device {}", ordinal))
        }
    }
}

/// Build everything a config describes and train.
pub fn train_from_config(config: &DecoderConfig) -> Result<TrainingSummary> {
    let device = parse_device(&config.device)?;
    let ctx = StepContext::new(device, config.precision.dtype());
    info!("Device {:?}, precision {:?} ({:?})", ctx.device, config.precision, ctx.dtype);

    let pipe = load_flux_pipeline(&config.weights(), &ctx, &config.load_options()?)
        .context("Failed to load pretrained pipeline")?;

    let record = match config.load_from_path() {
        Some(path) => Some(
            CheckpointRecord::load(&path, &ctx.device)
                .with_context(|| format!("Failed to read checkpoint {}", path.display()))?,
        ),
        None => None,
    };

    let mut decoder_config = GenerationDecoderConfig::new(config.adapter(), ctx);
    decoder_config.guidance = config.guidance;
    decoder_config.use_gradient_checkpointing = config.use_gradient_checkpointing;
    decoder_config.param_dtype = config.precision.param_dtype();
    let decoder = GenerationDecoder::new(pipe, decoder_config, record.as_ref())?;

    let source = BatchDir::open(&config.dataset_path)?;
    info!(
        "Found {} batch files in {} ({}x{}, batch size {})",
        source.len(),
        config.dataset_path.display(),
        config.height,
        config.width,
        config.batch_size
    );

    let mut trainer = DecoderTrainer::new(decoder, config.trainer())?;
    let summary = trainer.fit(&source)?;
    info!(
        "Training complete: {} optimizer steps, {} checkpoints",
        summary.optimizer_steps,
        summary.checkpoints.len()
    );
    Ok(summary)
}
