//! Adam with per-feature moment resets
//!
//! A standard Adam update (first/second moment tracking with bias
//! correction) over a set of *named* parameters, plus one extra operation
//! resampling needs: zeroing the moment slices for a specific set of learned
//! features of one parameter, without touching the parameter values or any
//! other slice's moments. Without the reset, stale moments would drag a
//! freshly resampled feature straight back toward its dead direction.
//!
//! Gradients are checked for non-finite values on every step; a NaN/inf
//! gradient is fatal (`SaeError::NonFiniteGradient`) since stepping on it
//! would poison the moment buffers.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tracing::debug;

use crate::error::SaeError;

/// Parameter name for the tied pre-encoder/post-decoder bias.
pub const B_TIED: &str = "b_tied";
/// Parameter name for the encoder weight (feature axis 0).
pub const W_ENC: &str = "w_enc";
/// Parameter name for the encoder bias (feature axis 0).
pub const B_ENC: &str = "b_enc";
/// Parameter name for the decoder weight (feature axis 1).
pub const W_DEC: &str = "w_dec";

/// A trainable variable registered under a stable name, with the axis along
/// which learned features lie (if any). The name is the contract that lets
/// resampling address "feature k of the encoder" and "feature k of the
/// decoder" consistently.
pub struct NamedParam {
    pub name: &'static str,
    pub var: Var,
    /// Axis of the parameter tensor indexed by learned feature, or `None`
    /// for parameters (like the tied bias) that have no per-feature slices.
    pub feature_axis: Option<usize>,
}

impl NamedParam {
    pub fn new(name: &'static str, var: Var, feature_axis: Option<usize>) -> Self {
        Self {
            name,
            var,
            feature_axis,
        }
    }
}

#[derive(Debug)]
struct ParamState {
    name: &'static str,
    var: Var,
    feature_axis: Option<usize>,
    /// First moment estimate, same shape as the parameter.
    m: Tensor,
    /// Second moment estimate, same shape as the parameter.
    v: Tensor,
}

/// Adam optimizer with named parameters and per-feature state resets.
#[derive(Debug)]
pub struct AdamWithReset {
    params: Vec<ParamState>,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    /// Step counter for bias correction.
    t: i32,
}

impl AdamWithReset {
    /// Create an optimizer tracking the given parameters. Moment buffers
    /// start at zero, the update rule's initial value.
    pub fn new(
        params: Vec<NamedParam>,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    ) -> Result<Self, SaeError> {
        let params = params
            .into_iter()
            .map(|p| {
                let m = p.var.as_tensor().zeros_like()?;
                let v = p.var.as_tensor().zeros_like()?;
                Ok(ParamState {
                    name: p.name,
                    var: p.var,
                    feature_axis: p.feature_axis,
                    m,
                    v,
                })
            })
            .collect::<Result<Vec<_>, SaeError>>()?;
        Ok(Self {
            params,
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
        })
    }

    /// Number of steps taken so far.
    pub fn steps_taken(&self) -> i32 {
        self.t
    }

    /// Apply one Adam update from the given gradient store.
    ///
    /// Parameters without a gradient in the store are skipped (their
    /// moments keep decaying only when they next receive a gradient, the
    /// usual lazy-Adam convention).
    pub fn step(&mut self, grads: &GradStore) -> Result<(), SaeError> {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);

        for param in &mut self.params {
            let Some(grad) = grads.get(param.var.as_tensor()) else {
                debug!("no gradient for parameter '{}' this step", param.name);
                continue;
            };

            let grad_sum: f32 = grad.sum_all()?.to_scalar()?;
            if !grad_sum.is_finite() {
                return Err(SaeError::NonFiniteGradient {
                    parameter: param.name.to_string(),
                    step: self.t as u64,
                });
            }

            let m = ((&param.m * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            let v = ((&param.v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;
            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let delta = ((m_hat * self.learning_rate)? / (v_hat.sqrt()? + self.epsilon)?)?;
            param
                .var
                .set(&(param.var.as_tensor() - delta)?.detach())?;
            param.m = m;
            param.v = v;
        }
        Ok(())
    }

    /// Zero the moment-estimate slices for the given learned features of
    /// one parameter. Parameter values are untouched; all other features'
    /// moments are untouched.
    ///
    /// Unknown parameter names are an explicit error, never a silent no-op.
    pub fn reset_feature_state(&mut self, name: &str, features: &[usize]) -> Result<(), SaeError> {
        if features.is_empty() {
            return Ok(());
        }
        let param = self
            .params
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| SaeError::UnknownParameter(name.to_string()))?;
        let axis = param
            .feature_axis
            .ok_or_else(|| SaeError::NoFeatureAxis(name.to_string()))?;

        let d_learned = param.var.as_tensor().dim(axis)?;
        for &index in features {
            if index >= d_learned {
                return Err(SaeError::FeatureIndexOutOfRange { index, d_learned });
            }
        }

        param.m = zero_feature_slices(&param.m, axis, features)?;
        param.v = zero_feature_slices(&param.v, axis, features)?;
        Ok(())
    }

    /// Snapshot of the moment buffers, for external checkpointing.
    /// Returns `(name, first_moment, second_moment)` per parameter.
    pub fn state(&self) -> Vec<(String, Tensor, Tensor)> {
        self.params
            .iter()
            .map(|p| (p.name.to_string(), p.m.clone(), p.v.clone()))
            .collect()
    }
}

/// Return a copy of `tensor` with the given indices along `axis` zeroed.
/// Supports the shapes the autoencoder actually has: 1-D (feature axis 0)
/// and 2-D (feature axis 0 or 1).
fn zero_feature_slices(tensor: &Tensor, axis: usize, features: &[usize]) -> Result<Tensor, SaeError> {
    let device = tensor.device();
    match tensor.dims() {
        [n] => {
            debug_assert_eq!(axis, 0);
            let mut data = tensor.to_vec1::<f32>()?;
            for &f in features {
                data[f] = 0.0;
            }
            Ok(Tensor::from_vec(data, (*n,), device)?)
        }
        [rows, cols] => {
            let mut data = tensor.to_vec2::<f32>()?;
            match axis {
                0 => {
                    for &f in features {
                        data[f].iter_mut().for_each(|x| *x = 0.0);
                    }
                }
                1 => {
                    for row in &mut data {
                        for &f in features {
                            row[f] = 0.0;
                        }
                    }
                }
                _ => {
                    return Err(SaeError::InvalidConfig(format!(
                        "feature axis {axis} out of range for 2-D parameter"
                    )))
                }
            }
            let flat: Vec<f32> = data.into_iter().flatten().collect();
            Ok(Tensor::from_vec(flat, (*rows, *cols), device)?)
        }
        dims => Err(SaeError::InvalidConfig(format!(
            "unsupported parameter rank {} for feature reset",
            dims.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn tracked_var(rows: usize, cols: usize) -> Var {
        let data: Vec<f32> = (0..rows * cols).map(|i| i as f32 * 0.1).collect();
        let t = Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap();
        Var::from_tensor(&t).unwrap()
    }

    fn optimizer_for(var: &Var, axis: Option<usize>) -> AdamWithReset {
        AdamWithReset::new(
            vec![NamedParam::new(W_ENC, var.clone(), axis)],
            1e-2,
            0.9,
            0.999,
            1e-8,
        )
        .unwrap()
    }

    #[test]
    fn test_step_moves_parameter_against_gradient() {
        let var = tracked_var(2, 3);
        let before = var.as_tensor().to_vec2::<f32>().unwrap();
        let mut opt = optimizer_for(&var, Some(0));

        // loss = sum(w) → gradient of ones → every entry should decrease.
        let loss = var.as_tensor().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();

        let after = var.as_tensor().to_vec2::<f32>().unwrap();
        for (row_before, row_after) in before.iter().zip(&after) {
            for (b, a) in row_before.iter().zip(row_after) {
                assert!(a < b, "expected decrease: {b} -> {a}");
            }
        }
        assert_eq!(opt.steps_taken(), 1);
    }

    #[test]
    fn test_reset_zeroes_only_selected_rows() {
        let var = tracked_var(4, 3);
        let mut opt = optimizer_for(&var, Some(0));

        // Two steps so the moments are non-zero everywhere.
        for _ in 0..2 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
        }

        let (_, m_before, v_before) = opt.state().remove(0);
        let m_before = m_before.to_vec2::<f32>().unwrap();
        let v_before = v_before.to_vec2::<f32>().unwrap();

        opt.reset_feature_state(W_ENC, &[1, 3]).unwrap();

        let (_, m_after, v_after) = opt.state().remove(0);
        let m_after = m_after.to_vec2::<f32>().unwrap();
        let v_after = v_after.to_vec2::<f32>().unwrap();

        for row in 0..4 {
            if row == 1 || row == 3 {
                assert!(m_after[row].iter().all(|&x| x == 0.0));
                assert!(v_after[row].iter().all(|&x| x == 0.0));
            } else {
                assert_eq!(m_after[row], m_before[row]);
                assert_eq!(v_after[row], v_before[row]);
            }
        }
    }

    #[test]
    fn test_reset_column_axis() {
        let var = tracked_var(3, 4);
        let mut opt = optimizer_for(&var, Some(1));
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();

        opt.reset_feature_state(W_ENC, &[0]).unwrap();
        let (_, m, _) = opt.state().remove(0);
        let m = m.to_vec2::<f32>().unwrap();
        for row in &m {
            assert_eq!(row[0], 0.0);
            assert!(row[1..].iter().any(|&x| x != 0.0));
        }
    }

    #[test]
    fn test_reset_does_not_touch_parameter_values() {
        let var = tracked_var(4, 3);
        let mut opt = optimizer_for(&var, Some(0));
        let loss = var.as_tensor().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();

        let before = var.as_tensor().to_vec2::<f32>().unwrap();
        opt.reset_feature_state(W_ENC, &[0, 2]).unwrap();
        let after = var.as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_unknown_parameter_is_error() {
        let var = tracked_var(2, 2);
        let mut opt = optimizer_for(&var, Some(0));
        let err = opt.reset_feature_state("w_typo", &[0]).unwrap_err();
        assert!(matches!(err, SaeError::UnknownParameter(_)));
    }

    #[test]
    fn test_no_feature_axis_is_error() {
        let var = tracked_var(2, 2);
        let mut opt = optimizer_for(&var, None);
        let err = opt.reset_feature_state(W_ENC, &[0]).unwrap_err();
        assert!(matches!(err, SaeError::NoFeatureAxis(_)));
    }

    #[test]
    fn test_empty_reset_is_noop() {
        let var = tracked_var(2, 2);
        let mut opt = optimizer_for(&var, Some(0));
        let loss = var.as_tensor().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();

        let (_, m_before, v_before) = opt.state().remove(0);
        opt.reset_feature_state(W_ENC, &[]).unwrap();
        let (_, m_after, v_after) = opt.state().remove(0);
        assert_eq!(
            m_before.to_vec2::<f32>().unwrap(),
            m_after.to_vec2::<f32>().unwrap()
        );
        assert_eq!(
            v_before.to_vec2::<f32>().unwrap(),
            v_after.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_non_finite_gradient_detected() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![1.0f32, f32::MAX], (2,), &device).unwrap();
        let var = Var::from_tensor(&t).unwrap();
        let mut opt = AdamWithReset::new(
            vec![NamedParam::new(B_ENC, var.clone(), Some(0))],
            1e-2,
            0.9,
            0.999,
            1e-8,
        )
        .unwrap();

        // d/dw sum(w^2) = 2w, and 2 * f32::MAX overflows to inf.
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let err = opt.step(&grads).unwrap_err();
        assert!(matches!(err, SaeError::NonFiniteGradient { .. }));
    }

    #[test]
    fn test_missing_gradient_is_skipped() {
        let var_a = tracked_var(2, 2);
        let var_b = tracked_var(2, 2);
        let before_b = var_b.as_tensor().to_vec2::<f32>().unwrap();
        let mut opt = AdamWithReset::new(
            vec![
                NamedParam::new(W_ENC, var_a.clone(), Some(0)),
                NamedParam::new(W_DEC, var_b.clone(), Some(1)),
            ],
            1e-2,
            0.9,
            0.999,
            1e-8,
        )
        .unwrap();

        // Loss only involves var_a.
        let loss = var_a.as_tensor().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();

        assert_eq!(var_b.as_tensor().to_vec2::<f32>().unwrap(), before_b);
    }
}
