//! Composite training loss: L1 sparsity + MSE reconstruction
//!
//! Reduction convention (fixed, not configurable): both terms are averaged
//! over the batch AND the feature/input dimension. Changing either reduction
//! to a sum rescales the effective `l1_coefficient`, so the convention is
//! part of the hyperparameter contract and must not drift between runs.

use anyhow::Result;
use candle_core::Tensor;

/// One training step's loss: the scalar graph tensor plus a named breakdown
/// for metrics, and the per-example reconstruction losses consumed by the
/// resampler's worst-reconstructed sampling.
pub struct LossOutput {
    /// Scalar loss tensor, still attached to the graph; call `backward()`
    /// on this.
    pub total: Tensor,
    /// Per-example MSE, shape `(batch,)`, detached.
    pub per_example_mse: Tensor,
    /// L1 term value (already scaled by the coefficient).
    pub l1_value: f64,
    /// MSE term value.
    pub mse_value: f64,
    /// Sum of the term values.
    pub total_value: f64,
}

impl LossOutput {
    /// Named sub-losses, in a shape ready for a metric sink.
    pub fn breakdown(&self) -> [(&'static str, f64); 3] {
        [
            ("loss/l1", self.l1_value),
            ("loss/mse", self.mse_value),
            ("loss/total", self.total_value),
        ]
    }
}

/// Compute the composite loss for one mini-batch.
///
/// * Sparsity: `l1_coefficient * mean(|learned_activations|)` over batch and
///   features. Activations are non-negative post-ReLU, so this is an L1
///   proxy for the active-feature count.
/// * Reconstruction: `mean((input - reconstruction)^2)` over batch and
///   input dimension.
/// * Total: additive; any future term plugs in the same way.
pub fn sae_training_loss(
    input: &Tensor,
    learned_activations: &Tensor,
    reconstruction: &Tensor,
    l1_coefficient: f64,
) -> Result<LossOutput> {
    let l1 = (learned_activations.abs()?.mean_all()? * l1_coefficient)?;

    let per_example_mse = (input - reconstruction)?.sqr()?.mean(1)?.detach();
    let mse = candle_nn::loss::mse(reconstruction, input)?;

    let total = (&l1 + &mse)?;

    let l1_value = f64::from(l1.to_scalar::<f32>()?);
    let mse_value = f64::from(mse.to_scalar::<f32>()?);
    Ok(LossOutput {
        total,
        per_example_mse,
        l1_value,
        mse_value,
        total_value: l1_value + mse_value,
    })
}
