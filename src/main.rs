//! sae-rs CLI: train a sparse autoencoder on synthetic activations
//!
//! Demo binary only: wires a `SyntheticSource` into the pipeline so the
//! whole engine can be exercised without a model in the loop. Real
//! deployments implement `ActivationSource` around a hooked forward pass.

use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use sae_rs::{Pipeline, SyntheticSource, TracingSink, TrainingConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-rs")]
#[command(about = "Sparse autoencoder training engine")]
#[command(version)]
struct Cli {
    /// Path to a JSON training config (overrides the dimension flags below)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input dimension of the activation vectors
    #[arg(long, default_value_t = 64)]
    d_in: usize,

    /// Learned dimension multiplier
    #[arg(long, default_value_t = 4)]
    expansion_factor: usize,

    /// Total activation budget
    #[arg(long, default_value_t = 100_000)]
    max_activations: u64,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Log metrics every N steps
    #[arg(long, default_value_t = 50)]
    log_interval: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig {
            n_input_features: cli.d_in,
            expansion_factor: cli.expansion_factor,
            l1_coefficient: 1e-3,
            learning_rate: 1e-3,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            train_batch_size: 256,
            max_store_size: 8_192,
            max_activations: cli.max_activations,
            resample_frequency: (cli.max_activations / 4).max(1),
            resample_probe_size: 512,
            source_data_batch_size: 512,
            dead_feature_threshold: 0.0,
            seed: cli.seed,
        },
    };

    println!("=== sae-rs: sparse autoencoder training ===");
    println!("d_in:       {}", config.n_input_features);
    println!("d_learned:  {}", config.n_learned_features());
    println!("budget:     {} activations", config.max_activations);

    let device = Device::Cpu;
    // Synthetic data with twice as many ground-truth directions as inputs,
    // so the expanded dictionary has real sparse structure to recover.
    let source = SyntheticSource::new(
        config.n_input_features,
        config.n_input_features * 2,
        config.seed,
        &device,
    );
    let metrics = TracingSink::new(cli.log_interval);

    let mut pipeline = Pipeline::new(config, source, metrics, &device)?;
    let progress = pipeline.run()?;

    info!(
        "trained for {} steps over {} cycles; {} resampling events",
        progress.steps,
        progress.cycles,
        progress.resample_events.len()
    );
    Ok(())
}
