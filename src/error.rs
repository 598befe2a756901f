//! Typed error taxonomy for the training engine
//!
//! Conditions that callers (and tests) need to distinguish get their own
//! variant here; everything else flows through `anyhow` with context at the
//! call site. Fatal numerical conditions carry cumulative progress so a
//! caller can resume from its last external checkpoint.

use thiserror::Error;

/// Errors raised by the training engine core.
#[derive(Error, Debug)]
pub enum SaeError {
    /// The activation store was asked to hold more vectors than its fixed
    /// capacity. This is a config/orchestration bug, never expected during
    /// a correct run.
    #[error("activation store capacity exceeded: {len} stored + {extra} appended > capacity {capacity}")]
    CapacityExceeded {
        len: usize,
        extra: usize,
        capacity: usize,
    },

    /// The training loss became NaN or infinite. Continuing would poison
    /// the optimizer moments, so the run halts immediately.
    #[error("non-finite loss at step {step} ({activations_processed} activations processed)")]
    NonFiniteLoss {
        step: u64,
        activations_processed: u64,
    },

    /// A gradient tensor contained NaN or infinite values.
    #[error("non-finite gradient for parameter '{parameter}' at step {step}")]
    NonFiniteGradient { parameter: String, step: u64 },

    /// A state-reset was requested for a parameter name the optimizer does
    /// not track. Explicit error rather than a silent no-op, so a typo in
    /// resampling code can never quietly skip a moment reset.
    #[error("optimizer does not track a parameter named '{0}'")]
    UnknownParameter(String),

    /// A feature-state reset was requested for a parameter that has no
    /// learned-feature axis (e.g. the tied bias).
    #[error("parameter '{0}' has no learned-feature axis to reset")]
    NoFeatureAxis(String),

    /// A feature index was out of range for the learned dimension.
    #[error("feature index {index} out of range (d_learned = {d_learned})")]
    FeatureIndexOutOfRange { index: usize, d_learned: usize },

    /// The training configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor-level failure from candle.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
