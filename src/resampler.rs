//! Dead-feature detection and resampling
//!
//! A learned feature that never activates across a large probe batch
//! contributes nothing to reconstruction and wastes capacity. This module
//! finds such features and re-points them at inputs the model currently
//! reconstructs worst:
//!
//! 1. Probe: run a fresh activation batch through the autoencoder; a
//!    feature is dead when its max activation over the batch is at or below
//!    the threshold (0.0 is exact thanks to ReLU).
//! 2. Replace: for each dead feature, sample one probe input with
//!    probability proportional to the *square* of its per-example
//!    reconstruction loss, **with replacement** — the dead count can exceed
//!    the number of distinct high-loss examples. The normalized input
//!    becomes the new decoder column; the encoder row is the same direction
//!    scaled to 0.2x the mean norm of alive encoder rows, so the new
//!    feature's activation scale matches its neighbours; the encoder bias
//!    entry resets to zero.
//! 3. Reset: zero the optimizer moments for exactly those feature slices,
//!    so stale momentum cannot drag the feature back toward its dead
//!    direction.
//!
//! Everything here is a direct parameter edit between training steps; no
//! gradients are involved and zero dead features is a complete no-op.

use anyhow::{Context, Result};
use candle_core::Tensor;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, warn};

use crate::autoencoder::SparseAutoencoder;
use crate::optimizer::{AdamWithReset, B_ENC, W_DEC, W_ENC};

/// Fraction of the mean alive-encoder-row norm given to resampled rows.
const ENCODER_NORM_SCALE: f32 = 0.2;

/// Replacement parameters for a set of dead features, index-aligned with
/// the dead-feature list they were computed for.
pub struct FeatureReplacements {
    pub encoder_rows: Vec<Vec<f32>>,
    pub decoder_columns: Vec<Vec<f32>>,
}

/// Detects and replaces dead learned features.
#[derive(Debug)]
pub struct ActivationResampler {
    /// A feature is dead when its max probe activation is <= this.
    dead_feature_threshold: f32,
}

impl ActivationResampler {
    pub fn new(dead_feature_threshold: f32) -> Self {
        Self {
            dead_feature_threshold,
        }
    }

    /// Indices of features whose activation never exceeds the threshold
    /// across the probe batch. Input shape `(probe, d_learned)`.
    pub fn find_dead_features(&self, learned_activations: &Tensor) -> Result<Vec<usize>> {
        let max_per_feature = learned_activations.max(0)?.to_vec1::<f32>()?;
        let dead = max_per_feature
            .iter()
            .enumerate()
            .filter(|(_, &max)| max <= self.dead_feature_threshold)
            .map(|(index, _)| index)
            .collect();
        Ok(dead)
    }

    /// Choose replacement directions for the given dead features.
    ///
    /// `probe_inputs` is the probe batch `(probe, d_in)`; `per_example_loss`
    /// its per-example reconstruction losses `(probe,)`. Sampling weight is
    /// the squared loss; if every weight is zero (perfect reconstruction of
    /// the whole probe), selection falls back to uniform.
    pub fn compute_replacements(
        &self,
        dead_features: &[usize],
        probe_inputs: &Tensor,
        per_example_loss: &Tensor,
        model: &SparseAutoencoder,
        rng: &mut StdRng,
    ) -> Result<FeatureReplacements> {
        let rows = probe_inputs.to_vec2::<f32>()?;
        let losses = per_example_loss.to_vec1::<f32>()?;
        anyhow::ensure!(
            rows.len() == losses.len(),
            "probe batch has {} inputs but {} per-example losses",
            rows.len(),
            losses.len()
        );
        anyhow::ensure!(!rows.is_empty(), "empty probe batch");

        let encoder_scale = self.alive_encoder_scale(model, dead_features)?;

        let weights: Vec<f32> = losses.iter().map(|&l| l * l).collect();
        let sampler = WeightedIndex::new(&weights).ok();
        if sampler.is_none() {
            debug!("probe losses all zero; falling back to uniform replacement sampling");
        }

        let mut encoder_rows = Vec::with_capacity(dead_features.len());
        let mut decoder_columns = Vec::with_capacity(dead_features.len());
        for _ in dead_features {
            let chosen = match &sampler {
                Some(s) => s.sample(rng),
                None => rng.gen_range(0..rows.len()),
            };
            let norm = rows[chosen]
                .iter()
                .map(|x| x * x)
                .sum::<f32>()
                .sqrt()
                .max(1e-6);
            let column: Vec<f32> = rows[chosen].iter().map(|x| x / norm).collect();
            let row: Vec<f32> = column.iter().map(|x| x * encoder_scale).collect();
            decoder_columns.push(column);
            encoder_rows.push(row);
        }
        Ok(FeatureReplacements {
            encoder_rows,
            decoder_columns,
        })
    }

    /// Write replacements into the model and reset the optimizer moments
    /// for exactly the resampled feature slices.
    pub fn apply(
        &self,
        dead_features: &[usize],
        replacements: &FeatureReplacements,
        model: &SparseAutoencoder,
        optimizer: &mut AdamWithReset,
    ) -> Result<()> {
        if dead_features.is_empty() {
            return Ok(());
        }
        model.replace_features(
            dead_features,
            &replacements.encoder_rows,
            &replacements.decoder_columns,
        )?;
        optimizer.reset_feature_state(W_ENC, dead_features)?;
        optimizer.reset_feature_state(B_ENC, dead_features)?;
        optimizer.reset_feature_state(W_DEC, dead_features)?;
        Ok(())
    }

    /// Full resampling pass: probe, detect, replace, reset. Returns the
    /// number of features resampled. Zero dead features leaves both the
    /// model and the optimizer completely untouched.
    pub fn resample(
        &self,
        probe_inputs: &Tensor,
        model: &SparseAutoencoder,
        optimizer: &mut AdamWithReset,
        rng: &mut StdRng,
    ) -> Result<usize> {
        let (learned, reconstruction) = model.forward(probe_inputs)?;
        let dead = self.find_dead_features(&learned)?;
        if dead.is_empty() {
            debug!("resampling probe found no dead features");
            return Ok(0);
        }

        let per_example_loss = (probe_inputs - &reconstruction)?.sqr()?.mean(1)?.detach();
        let replacements = self
            .compute_replacements(&dead, probe_inputs, &per_example_loss, model, rng)
            .context("computing replacement directions")?;
        self.apply(&dead, &replacements, model, optimizer)
            .context("applying feature replacements")?;
        Ok(dead.len())
    }

    /// Scale for resampled encoder rows: 0.2x the mean L2 norm of alive
    /// encoder rows. With no alive feature to measure (everything dead),
    /// fall back to the bare 0.2 constant — recovered locally, logged,
    /// never fatal.
    fn alive_encoder_scale(
        &self,
        model: &SparseAutoencoder,
        dead_features: &[usize],
    ) -> Result<f32> {
        let norms = model.encoder_row_norms()?;
        let alive: Vec<f32> = norms
            .iter()
            .enumerate()
            .filter(|(i, _)| !dead_features.contains(i))
            .map(|(_, &n)| n)
            .collect();
        if alive.is_empty() {
            warn!(
                "no alive encoder rows to derive a replacement scale from; \
                 using default {ENCODER_NORM_SCALE}"
            );
            return Ok(ENCODER_NORM_SCALE);
        }
        let mean = alive.iter().sum::<f32>() / alive.len() as f32;
        Ok(ENCODER_NORM_SCALE * mean)
    }
}
