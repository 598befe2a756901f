//! Activation source seam
//!
//! The engine treats the source model plus its dataset as one opaque batched
//! function: "give me n activation vectors captured at the tap point". Real
//! deployments implement [`ActivationSource`] around a hooked forward pass;
//! failures propagate unchanged — retry policy (e.g. skipping a corrupt
//! input batch) belongs to the model/data layer, not this engine.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Produces batches of activation vectors at the configured tap point.
pub trait ActivationSource {
    /// Width of the produced vectors (`d_in`).
    fn d_in(&self) -> usize;

    /// Generate the next `n` activation vectors, shape `(n, d_in)`.
    ///
    /// The sequence is effectively infinite; the engine never asks for more
    /// than it is about to train on.
    fn next_activations(&mut self, n: usize) -> Result<Tensor>;
}

/// Deterministic synthetic source: activations are sparse non-negative
/// combinations of a fixed set of hidden ground-truth directions.
///
/// Gives the demo binary and integration tests data with genuine sparse
/// structure for the autoencoder to recover, without a real model forward
/// pass in the loop.
#[derive(Debug)]
pub struct SyntheticSource {
    directions: Vec<Vec<f32>>,
    d_in: usize,
    /// Probability that each ground-truth direction is active in a sample.
    activation_probability: f32,
    rng: StdRng,
    device: Device,
}

impl SyntheticSource {
    /// Create a source with `n_directions` random unit directions in
    /// `d_in`-dimensional space.
    pub fn new(d_in: usize, n_directions: usize, seed: u64, device: &Device) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let directions = (0..n_directions)
            .map(|_| {
                let mut v: Vec<f32> = (0..d_in).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
                v.iter_mut().for_each(|x| *x /= norm);
                v
            })
            .collect();
        Self {
            directions,
            d_in,
            activation_probability: 0.15,
            rng,
            device: device.clone(),
        }
    }
}

impl ActivationSource for SyntheticSource {
    fn d_in(&self) -> usize {
        self.d_in
    }

    fn next_activations(&mut self, n: usize) -> Result<Tensor> {
        let mut flat = vec![0.0f32; n * self.d_in];
        for row in flat.chunks_mut(self.d_in) {
            // At least one direction fires per sample so no row is all-zero.
            let forced = self.rng.gen_range(0..self.directions.len());
            for (k, direction) in self.directions.iter().enumerate() {
                let fires = k == forced || self.rng.gen::<f32>() < self.activation_probability;
                if fires {
                    let coefficient = self.rng.gen_range(0.1..1.0);
                    for (x, &d) in row.iter_mut().zip(direction) {
                        *x += coefficient * d;
                    }
                }
            }
        }
        Ok(Tensor::from_vec(flat, (n, self.d_in), &self.device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_shapes_and_determinism() {
        let device = Device::Cpu;
        let mut a = SyntheticSource::new(6, 12, 9, &device);
        let mut b = SyntheticSource::new(6, 12, 9, &device);

        let batch_a = a.next_activations(5).unwrap();
        let batch_b = b.next_activations(5).unwrap();
        assert_eq!(batch_a.dims(), &[5, 6]);
        assert_eq!(
            batch_a.to_vec2::<f32>().unwrap(),
            batch_b.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_no_all_zero_rows() {
        let device = Device::Cpu;
        let mut source = SyntheticSource::new(4, 8, 3, &device);
        let batch = source.next_activations(64).unwrap();
        for row in batch.to_vec2::<f32>().unwrap() {
            assert!(row.iter().any(|&x| x != 0.0));
        }
    }
}
