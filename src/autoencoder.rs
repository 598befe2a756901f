//! Sparse autoencoder model
//!
//! A single hidden layer with a tied pre-encoder/post-decoder bias:
//!
//! ```text
//! Encode:  acts = ReLU(W_enc @ (x - b_tied) + b_enc)
//! Decode:  x_hat = W_dec @ acts + b_tied
//! ```
//!
//! The tied bias means the encoder only represents *deviation* from a fixed
//! reference point, which keeps learned directions interpretable. Decoder
//! columns (one per learned feature) are constrained to unit L2 norm after
//! every optimizer step; without that constraint the model could scale the
//! decoder down and the encoder up to dodge the sparsity penalty at no
//! reconstruction cost.
//!
//! All parameters are `candle_core::Var` so a backward pass through
//! `encode`/`decode` populates a `GradStore` keyed by these variables.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::SaeError;
use crate::optimizer::{NamedParam, B_ENC, B_TIED, W_DEC, W_ENC};

/// Linear sparse autoencoder with a tied bias and unit-norm decoder columns.
#[derive(Debug)]
pub struct SparseAutoencoder {
    /// Tied bias, shape `(d_in,)`. Subtracted before encoding, added back
    /// after decoding. Trainable; seeded near the data's geometric median.
    b_tied: Var,
    /// Encoder weight, shape `(d_learned, d_in)`. Row k is feature k.
    w_enc: Var,
    /// Encoder bias, shape `(d_learned,)`.
    b_enc: Var,
    /// Decoder weight, shape `(d_in, d_learned)`. Column k is feature k,
    /// unit L2 norm after every `renormalize_decoder()` call.
    w_dec: Var,
    d_in: usize,
    d_learned: usize,
    device: Device,
}

impl SparseAutoencoder {
    /// Create a new autoencoder with Kaiming-uniform weights drawn from the
    /// given RNG and the tied bias seeded from `tied_bias_seed` (typically
    /// the geometric median of a sample of real activations).
    ///
    /// Decoder columns are renormalized immediately so the unit-norm
    /// invariant holds before the first forward pass.
    pub fn new(
        d_in: usize,
        d_learned: usize,
        tied_bias_seed: &[f32],
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        anyhow::ensure!(d_in > 0 && d_learned > 0, "dimensions must be > 0");
        anyhow::ensure!(
            tied_bias_seed.len() == d_in,
            "tied bias seed has length {}, expected d_in = {d_in}",
            tied_bias_seed.len()
        );

        let w_enc = uniform_init(d_learned, d_in, rng, device)?;
        let w_dec = uniform_init(d_in, d_learned, rng, device)?;
        let b_tied = Tensor::from_vec(tied_bias_seed.to_vec(), (d_in,), device)?;

        let model = Self {
            b_tied: Var::from_tensor(&b_tied)?,
            w_enc: Var::from_tensor(&w_enc)?,
            b_enc: Var::zeros((d_learned,), DType::F32, device)?,
            w_dec: Var::from_tensor(&w_dec)?,
            d_in,
            d_learned,
            device: device.clone(),
        };
        model.renormalize_decoder()?;
        Ok(model)
    }

    /// Input dimension (`d_in`).
    pub fn d_in(&self) -> usize {
        self.d_in
    }

    /// Learned dimension (`d_learned`).
    pub fn d_learned(&self) -> usize {
        self.d_learned
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Encode a batch of activations into learned-feature space.
    ///
    /// Input shape `(batch, d_in)`. Returns `(learned_activations,
    /// pre_activation)`, both `(batch, d_learned)`. Learned activations are
    /// non-negative (ReLU), which is what makes the L1 penalty a meaningful
    /// proxy for feature count.
    pub fn encode(&self, input: &Tensor) -> Result<(Tensor, Tensor)> {
        let centered = input.broadcast_sub(self.b_tied.as_tensor())?;
        let pre_activation = centered
            .matmul(&self.w_enc.as_tensor().t()?)?
            .broadcast_add(self.b_enc.as_tensor())?;
        let learned = pre_activation.relu()?;
        Ok((learned, pre_activation))
    }

    /// Decode learned activations back into input space.
    ///
    /// Input shape `(batch, d_learned)`, output `(batch, d_in)`.
    pub fn decode(&self, learned: &Tensor) -> Result<Tensor> {
        let reconstruction = learned
            .matmul(&self.w_dec.as_tensor().t()?)?
            .broadcast_add(self.b_tied.as_tensor())?;
        Ok(reconstruction)
    }

    /// Full forward pass: `(learned_activations, reconstruction)`.
    pub fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor)> {
        let (learned, _pre) = self.encode(input)?;
        let reconstruction = self.decode(&learned)?;
        Ok((learned, reconstruction))
    }

    /// Renormalize every decoder column to unit L2 norm.
    ///
    /// Must run after every optimizer step, before the next forward pass.
    /// Columns with vanishing norm are left guarded by a tiny floor instead
    /// of dividing by zero.
    pub fn renormalize_decoder(&self) -> Result<()> {
        let w = self.w_dec.as_tensor();
        let norms = w.sqr()?.sum_keepdim(0)?.sqrt()?; // (1, d_learned)
        let norms = norms.maximum(1e-12)?;
        let normalized = w.broadcast_div(&norms)?;
        self.w_dec.set(&normalized.detach())?;
        Ok(())
    }

    /// L2 norm of each decoder column, as plain f32s.
    pub fn decoder_column_norms(&self) -> Result<Vec<f32>> {
        let norms = self
            .w_dec
            .as_tensor()
            .sqr()?
            .sum(0)?
            .sqrt()?
            .to_vec1::<f32>()?;
        Ok(norms)
    }

    /// L2 norm of each encoder row (one per learned feature).
    pub fn encoder_row_norms(&self) -> Result<Vec<f32>> {
        let norms = self
            .w_enc
            .as_tensor()
            .sqr()?
            .sum(1)?
            .sqrt()?
            .to_vec1::<f32>()?;
        Ok(norms)
    }

    /// Overwrite the parameters of a set of learned features.
    ///
    /// For each `features[i]`: encoder row := `encoder_rows[i]`, decoder
    /// column := `decoder_columns[i]`, encoder bias entry := 0. This is a
    /// direct parameter edit used by resampling; it goes through
    /// `Var::set` with freshly built tensors, so no gradient graph is
    /// involved.
    pub fn replace_features(
        &self,
        features: &[usize],
        encoder_rows: &[Vec<f32>],
        decoder_columns: &[Vec<f32>],
    ) -> Result<()> {
        anyhow::ensure!(
            features.len() == encoder_rows.len() && features.len() == decoder_columns.len(),
            "feature/replacement count mismatch: {} features, {} rows, {} columns",
            features.len(),
            encoder_rows.len(),
            decoder_columns.len()
        );
        if features.is_empty() {
            return Ok(());
        }
        for &index in features {
            if index >= self.d_learned {
                return Err(SaeError::FeatureIndexOutOfRange {
                    index,
                    d_learned: self.d_learned,
                }
                .into());
            }
        }

        let mut w_enc = self.w_enc.as_tensor().to_vec2::<f32>()?;
        let mut w_dec = self.w_dec.as_tensor().to_vec2::<f32>()?;
        let mut b_enc = self.b_enc.as_tensor().to_vec1::<f32>()?;

        for (i, &feature) in features.iter().enumerate() {
            anyhow::ensure!(
                encoder_rows[i].len() == self.d_in && decoder_columns[i].len() == self.d_in,
                "replacement direction for feature {feature} has wrong length"
            );
            w_enc[feature].copy_from_slice(&encoder_rows[i]);
            for (row, w_dec_row) in w_dec.iter_mut().enumerate() {
                w_dec_row[feature] = decoder_columns[i][row];
            }
            b_enc[feature] = 0.0;
        }

        self.w_enc.set(&rows_to_tensor(&w_enc, &self.device)?)?;
        self.w_dec.set(&rows_to_tensor(&w_dec, &self.device)?)?;
        self.b_enc
            .set(&Tensor::from_vec(b_enc, (self.d_learned,), &self.device)?)?;
        Ok(())
    }

    /// Named parameters with their learned-feature axis, for the optimizer.
    pub fn named_parameters(&self) -> Vec<NamedParam> {
        vec![
            NamedParam::new(B_TIED, self.b_tied.clone(), None),
            NamedParam::new(W_ENC, self.w_enc.clone(), Some(0)),
            NamedParam::new(B_ENC, self.b_enc.clone(), Some(0)),
            NamedParam::new(W_DEC, self.w_dec.clone(), Some(1)),
        ]
    }

    /// Snapshot of the current parameter tensors, for external
    /// checkpointing. The engine does not persist anything itself.
    pub fn parameters(&self) -> Vec<(String, Tensor)> {
        vec![
            (B_TIED.to_string(), self.b_tied.as_tensor().clone()),
            (W_ENC.to_string(), self.w_enc.as_tensor().clone()),
            (B_ENC.to_string(), self.b_enc.as_tensor().clone()),
            (W_DEC.to_string(), self.w_dec.as_tensor().clone()),
        ]
    }
}

/// Kaiming-style uniform init: `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
fn uniform_init(rows: usize, cols: usize, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let bound = 1.0 / (cols as f32).sqrt();
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

fn rows_to_tensor(rows: &[Vec<f32>], device: &Device) -> Result<Tensor> {
    let n = rows.len();
    let d = rows.first().map_or(0, Vec::len);
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (n, d), device)?)
}

/// Geometric median of a set of points via Weiszfeld iteration.
///
/// Used to seed the tied bias near a robust central estimate of the real
/// activation distribution, so the encoder starts out modelling deviation
/// from "typical" rather than raw magnitude.
pub fn geometric_median(points: &[Vec<f32>], max_iterations: usize, tolerance: f32) -> Vec<f32> {
    assert!(!points.is_empty(), "geometric median of an empty set");
    let d = points[0].len();

    // Start from the arithmetic mean.
    let mut estimate = vec![0.0f32; d];
    for point in points {
        for (e, &x) in estimate.iter_mut().zip(point) {
            *e += x;
        }
    }
    for e in &mut estimate {
        *e /= points.len() as f32;
    }

    for _ in 0..max_iterations {
        let mut numerator = vec![0.0f32; d];
        let mut denominator = 0.0f32;
        for point in points {
            let dist: f32 = point
                .iter()
                .zip(&estimate)
                .map(|(&x, &e)| (x - e) * (x - e))
                .sum::<f32>()
                .sqrt();
            if dist < 1e-10 {
                // Estimate coincides with a data point; it is the median.
                return estimate;
            }
            let weight = 1.0 / dist;
            for (n, &x) in numerator.iter_mut().zip(point) {
                *n += x * weight;
            }
            denominator += weight;
        }

        let next: Vec<f32> = numerator.iter().map(|&n| n / denominator).collect();
        let shift: f32 = next
            .iter()
            .zip(&estimate)
            .map(|(&a, &b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt();
        estimate = next;
        if shift < tolerance {
            break;
        }
    }
    estimate
}
