//! Fine-tune the embedding-conditioned Flux decoder
//!
//! Usage: cargo run --release --bin train_decoder -- --config /path/to/decoder.yaml

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train the embedding-conditioned Flux decoder")]
struct Args {
    /// Path to the training configuration YAML file
    #[arg(long)]
    config: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    generation_decoder::logging::init_logger();

    info!("Loading config: {}", args.config.display());
    let config = generation_decoder::trainers::load_config(&args.config)?;

    let summary = generation_decoder::trainers::train_from_config(&config).context("Training failed")?;
    if let Some(path) = summary.checkpoints.last() {
        info!("Last checkpoint: {}", path.display());
    }
    Ok(())
}
