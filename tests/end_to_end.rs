mod common;

use candle_core::{DType, Device, Tensor};
use generation_decoder::trainers::{
    BatchGeometry, CheckpointRecord, DecoderTrainer, GenerationDecoder, StepDraws, TrainerConfig, TrainingBatch,
};
use generation_decoder::trainers::{OptimizerConfig, ADAPTER_PREFIX, DIT_PREFIX};
use generation_decoder::{Error, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};

use common::{decoder_config, known_noise, stub_pipeline, tiny_flux_pipeline, NUM_TIMESTEPS};

fn zero_latent_batch() -> Result<TrainingBatch> {
    let device = Device::Cpu;
    Ok(TrainingBatch::with_latents(
        Tensor::randn(0f32, 1f32, (1, 4, 8), &device)?,
        Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?,
    ))
}

#[test]
fn test_identity_backbone_loss_matches_mse() -> Result<()> {
    let decoder = GenerationDecoder::new(stub_pipeline()?, decoder_config(), None)?;
    let batch = zero_latent_batch()?;
    let noise = known_noise((1, 3, 8, 8))?;
    let draws = StepDraws {
        noise: noise.clone(),
        timestep_id: 3,
    };

    let first = decoder.compute_loss(&batch, &draws)?;
    let second = decoder.compute_loss(&batch, &draws)?;

    // identity(latent + noise) with zero latents is the noise itself
    let stub_output = (batch.latents.as_ref().expect("latents present") + &noise)?;
    let expected = candle_nn::loss::mse(&stub_output, &noise)?.to_scalar::<f32>()?;

    assert!(first.loss_value.is_finite());
    assert_eq!(first.loss_value.to_bits(), second.loss_value.to_bits());
    assert_eq!(first.loss_value, expected);
    assert_eq!(first.timestep, 3.0);
    assert!(first.loss.dims().is_empty());
    Ok(())
}

#[test]
fn test_nonzero_latents_give_positive_loss() -> Result<()> {
    let decoder = GenerationDecoder::new(stub_pipeline()?, decoder_config(), None)?;
    let latents = Tensor::full(0.5f32, (2, 3, 8, 8), &Device::Cpu)?;
    let batch = TrainingBatch::with_latents(Tensor::ones((2, 4, 8), DType::F32, &Device::Cpu)?, latents);
    let draws = StepDraws {
        noise: known_noise((2, 3, 8, 8))?,
        timestep_id: 0,
    };
    // pred = latent + noise, target = noise
    let output = decoder.compute_loss(&batch, &draws)?;
    assert!((output.loss_value - 0.25).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_trainable_set_is_adapter_plus_backbone() -> Result<()> {
    let decoder = GenerationDecoder::new(stub_pipeline()?, decoder_config(), None)?;
    let trainable = decoder.trainable();

    let adapter_names: Vec<&str> = trainable.adapter().iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        adapter_names,
        vec!["0.bias", "0.weight", "1.bias", "1.weight", "3.bias", "3.weight", "4.bias", "4.weight"]
    );
    let backbone_names: Vec<&str> = trainable.backbone().iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(backbone_names, vec!["scale"]);

    let ids: HashSet<_> = trainable.trainable_vars().iter().map(|v| v.as_tensor().id()).collect();
    assert_eq!(ids.len(), 9);

    // gradients reach exactly the trainable vars that take part in the loss
    let output = decoder.training_step(&zero_latent_batch()?)?;
    let grads = output.loss.backward()?;
    let scale = &trainable.backbone()[0].1;
    assert!(grads.get(scale).is_some());
    Ok(())
}

#[test]
fn test_flux_step_reaches_every_trainable_weight() -> Result<()> {
    let decoder = GenerationDecoder::new(tiny_flux_pipeline()?, decoder_config(), None)?;
    let batch = TrainingBatch::with_latents(
        Tensor::randn(0f32, 1f32, (2, 3, 8), &Device::Cpu)?,
        Tensor::randn(0f32, 1f32, (2, 4, 4, 4), &Device::Cpu)?,
    );
    let output = decoder.training_step_with_rng(&batch, &mut StdRng::seed_from_u64(7))?;
    let grads = output.loss.backward()?;

    let trainable = decoder.trainable();
    let backbone_names: Vec<&str> = trainable.backbone().iter().map(|(n, _)| n.as_str()).collect();
    assert!(backbone_names.contains(&"img_in.weight"));
    assert!(backbone_names.contains(&"double_blocks.0.img_attn.norm.query_norm.scale"));
    assert!(backbone_names.contains(&"single_blocks.0.norm.key_norm.scale"));

    for (name, var) in trainable.backbone().iter().chain(trainable.adapter()) {
        assert!(grads.get(var).is_some(), "no gradient for {}", name);
    }
    Ok(())
}

#[test]
fn test_sampled_timesteps_are_uniform_and_in_range() -> Result<()> {
    let decoder = GenerationDecoder::new(stub_pipeline()?, decoder_config(), None)?;
    let latents = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu)?;
    let mut rng = StdRng::seed_from_u64(1234);
    let (lo, hi) = decoder.pipeline().scheduler.timestep_range();

    let draws = 20_000;
    let mut counts = vec![0usize; NUM_TIMESTEPS];
    for _ in 0..draws {
        let sample = decoder.sample_draws(&latents, &mut rng)?;
        counts[sample.timestep_id] += 1;
        let t = decoder.pipeline().scheduler.timesteps()[sample.timestep_id];
        assert!(t >= lo && t <= hi);
    }
    let expected = draws as f64 / NUM_TIMESTEPS as f64;
    for count in counts {
        assert!((count as f64 - expected).abs() < expected * 0.1, "bucket count {}", count);
    }
    Ok(())
}

#[test]
fn test_checkpoint_file_round_trip_is_bit_identical() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("decoder.safetensors");

    let source = GenerationDecoder::new(stub_pipeline()?, decoder_config(), None)?;
    let record = source.state_record()?;
    for key in record.tensors().keys() {
        assert!(key.starts_with(ADAPTER_PREFIX) || key.starts_with(DIT_PREFIX), "stray key {}", key);
    }
    assert_eq!(record.len(), 9);
    record.save(&path)?;

    let loaded = CheckpointRecord::load(&path, &Device::Cpu)?;
    let restored = GenerationDecoder::new(stub_pipeline()?, decoder_config(), Some(&loaded))?;
    let again = restored.state_record()?;
    for (key, tensor) in record.tensors() {
        let a = tensor.flatten_all()?.to_vec1::<f32>()?;
        let b = again.tensors()[key].flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(
            a.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            "{} differs",
            key
        );
    }
    Ok(())
}

#[test]
fn test_prior_checkpoint_overrides_fresh_init() -> Result<()> {
    let fresh = GenerationDecoder::new(stub_pipeline()?, decoder_config(), None)?;
    let mut tensors = HashMap::new();
    for (key, tensor) in fresh.state_record()?.tensors() {
        tensors.insert(key.clone(), tensor.ones_like()?.affine(0.25, 0.0)?);
    }
    let prior = CheckpointRecord::from_tensors(tensors);

    let decoder = GenerationDecoder::new(stub_pipeline()?, decoder_config(), Some(&prior))?;
    for (key, tensor) in decoder.state_record()?.tensors() {
        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| *v == 0.25), "{} kept fresh values", key);
    }
    Ok(())
}

#[test]
fn test_checkpoint_with_unknown_key_is_fatal() -> Result<()> {
    let fresh = GenerationDecoder::new(stub_pipeline()?, decoder_config(), None)?;
    let mut tensors = fresh.state_record()?.tensors().clone();
    tensors.insert("adapter.5.weight".to_string(), Tensor::zeros(4, DType::F32, &Device::Cpu)?);
    let record = CheckpointRecord::from_tensors(tensors);

    let result = GenerationDecoder::new(stub_pipeline()?, decoder_config(), Some(&record));
    assert!(matches!(result, Err(Error::Checkpoint { ref key, .. }) if key == "adapter.5.weight"));
    Ok(())
}

#[test]
fn test_trainer_runs_epochs_and_writes_checkpoints() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let device = Device::Cpu;
    let batches: Vec<TrainingBatch> = (0..3)
        .map(|_| -> Result<TrainingBatch> {
            Ok(TrainingBatch::with_latents(
                Tensor::randn(0f32, 1f32, (1, 4, 8), &device)?,
                Tensor::randn(0f32, 1f32, (1, 3, 8, 8), &device)?,
            ))
        })
        .collect::<Result<_>>()?;

    let decoder = GenerationDecoder::new(stub_pipeline()?, decoder_config(), None)?;
    let config = TrainerConfig {
        max_epochs: 2,
        steps_per_epoch: 4,
        accumulate_grad_batches: 2,
        log_every_n_steps: 1,
        output_path: dir.path().to_path_buf(),
        optimizer: OptimizerConfig::new(1e-3, 2),
        geometry: None,
    };
    let mut trainer = DecoderTrainer::new(decoder, config)?;
    let summary = trainer.fit_with_rng(&batches, &mut StdRng::seed_from_u64(0))?;

    assert_eq!(summary.optimizer_steps, 4);
    assert_eq!(summary.checkpoints.len(), 2);
    assert!(summary.checkpoints.iter().all(|p| p.exists()));
    assert!(summary.checkpoints[1].ends_with("epoch=1-step=4.safetensors"));

    let rates: Vec<f64> = trainer.history().iter().map(|m| m.train_learning_rate).collect();
    assert_eq!(rates, vec![0.0, 5e-4, 1e-3, 1e-3]);

    let metrics = std::fs::read_to_string(dir.path().join("metrics.jsonl"))?;
    assert_eq!(metrics.lines().count(), 4);
    assert!(metrics.contains("train_loss"));

    // the written checkpoint restores into a fresh decoder
    let record = CheckpointRecord::load(&summary.checkpoints[1], &device)?;
    GenerationDecoder::new(stub_pipeline()?, decoder_config(), Some(&record))?;
    Ok(())
}

#[test]
fn test_trainer_rejects_batches_of_the_wrong_resolution() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let batches = vec![zero_latent_batch()?];
    let decoder = GenerationDecoder::new(stub_pipeline()?, decoder_config(), None)?;
    let config = TrainerConfig {
        output_path: dir.path().to_path_buf(),
        steps_per_epoch: 1,
        geometry: Some(BatchGeometry {
            batch_size: 1,
            height: 1024,
            width: 1024,
        }),
        ..Default::default()
    };
    let mut trainer = DecoderTrainer::new(decoder, config)?;
    let result = trainer.fit_with_rng(&batches, &mut StdRng::seed_from_u64(0));
    assert!(matches!(result, Err(Error::ShapeMismatch { ref tensor, .. }) if tensor == "latents"));
    assert_eq!(trainer.optimization().step_count(), 0);
    Ok(())
}

#[test]
fn test_scheduler_swaps_without_touching_the_step() -> Result<()> {
    use generation_decoder::trainers::ddpm_scheduler::{DdpmScheduler, PredictionType};

    let mut pipe = stub_pipeline()?;
    pipe.scheduler = Box::new(DdpmScheduler::stable_diffusion(1000, PredictionType::Epsilon)?.with_min_snr_gamma(5.0)?);
    let decoder = GenerationDecoder::new(pipe, decoder_config(), None)?;

    let batch = TrainingBatch::with_latents(
        Tensor::ones((1, 4, 8), DType::F32, &Device::Cpu)?,
        Tensor::full(0.5f32, (1, 3, 8, 8), &Device::Cpu)?,
    );
    let output = decoder.training_step_with_rng(&batch, &mut StdRng::seed_from_u64(3))?;
    assert!(output.timestep_id < 1000);
    assert_eq!(output.timestep, output.timestep_id as f64);
    assert!(output.loss_value.is_finite() && output.loss_value > 0.0);
    Ok(())
}
