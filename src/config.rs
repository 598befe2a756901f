//! Training configuration
//!
//! One immutable struct covering the autoencoder geometry, loss and
//! optimizer hyperparameters, and the orchestration schedule. Loadable from
//! JSON so sweeps can drive the engine with generated config files.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SaeError;

/// Hyperparameters for one training run. Immutable once the pipeline starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Width of the activation vectors captured at the tap point (`d_in`).
    pub n_input_features: usize,
    /// Learned dimension multiplier: `d_learned = n_input_features * expansion_factor`.
    pub expansion_factor: usize,
    /// Coefficient on the L1 sparsity penalty.
    pub l1_coefficient: f64,
    /// Adam learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Adam first-moment decay.
    #[serde(default = "default_beta1")]
    pub adam_beta1: f64,
    /// Adam second-moment decay.
    #[serde(default = "default_beta2")]
    pub adam_beta2: f64,
    /// Adam denominator epsilon.
    #[serde(default = "default_epsilon")]
    pub adam_epsilon: f64,
    /// Mini-batch size for training passes over the store.
    pub train_batch_size: usize,
    /// Fixed capacity of the activation store (hard memory ceiling).
    pub max_store_size: usize,
    /// Total activation budget; the run terminates once this many
    /// activations have been trained on.
    pub max_activations: u64,
    /// Resampling interval, in activations processed.
    pub resample_frequency: u64,
    /// Number of freshly generated activations used to probe for dead
    /// features at each resampling event.
    #[serde(default = "default_probe_size")]
    pub resample_probe_size: usize,
    /// Number of activations requested from the source per generation call.
    pub source_data_batch_size: usize,
    /// A learned feature is dead when its max activation over the probe
    /// batch is at or below this threshold (0.0 is exact, thanks to ReLU).
    #[serde(default)]
    pub dead_feature_threshold: f64,
    /// Seed for every stochastic choice: shuffling, weighted sampling,
    /// parameter init. Two runs with the same seed and source are identical.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_learning_rate() -> f64 {
    1e-3
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_epsilon() -> f64 {
    1e-8
}
fn default_probe_size() -> usize {
    512
}
fn default_seed() -> u64 {
    42
}

impl TrainingConfig {
    /// Learned dimension of the autoencoder.
    pub fn n_learned_features(&self) -> usize {
        self.n_input_features * self.expansion_factor
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency before a run starts.
    pub fn validate(&self) -> Result<(), SaeError> {
        let fail = |msg: String| Err(SaeError::InvalidConfig(msg));
        if self.n_input_features == 0 {
            return fail("n_input_features must be > 0".to_string());
        }
        if self.expansion_factor == 0 {
            return fail("expansion_factor must be >= 1".to_string());
        }
        if self.train_batch_size == 0 {
            return fail("train_batch_size must be > 0".to_string());
        }
        if self.source_data_batch_size == 0 {
            return fail("source_data_batch_size must be > 0".to_string());
        }
        if self.max_store_size == 0 {
            return fail("max_store_size must be > 0".to_string());
        }
        if self.max_activations == 0 {
            return fail("max_activations must be > 0".to_string());
        }
        if self.resample_frequency == 0 {
            return fail("resample_frequency must be > 0".to_string());
        }
        if self.resample_probe_size == 0 {
            return fail("resample_probe_size must be > 0".to_string());
        }
        if self.l1_coefficient < 0.0 {
            return fail(format!(
                "l1_coefficient must be >= 0, got {}",
                self.l1_coefficient
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            ));
        }
        if !(0.0..1.0).contains(&self.adam_beta1) || !(0.0..1.0).contains(&self.adam_beta2) {
            return fail(format!(
                "adam betas must lie in [0, 1), got ({}, {})",
                self.adam_beta1, self.adam_beta2
            ));
        }
        if self.train_batch_size > self.max_store_size {
            return fail(format!(
                "train_batch_size {} exceeds max_store_size {}",
                self.train_batch_size, self.max_store_size
            ));
        }
        Ok(())
    }
}
