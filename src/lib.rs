// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // u64→usize in budget accounting
#![allow(clippy::many_single_char_names)] // x, m, v, k standard in math
#![allow(clippy::similar_names)] // related variables like `w_enc`/`b_enc`
#![allow(clippy::module_name_repetitions)] // ActivationStore in store.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! sae-rs: sparse autoencoder training engine
//!
//! Trains a sparse autoencoder to re-express the internal activations of a
//! pretrained sequence model as sparse combinations of learned feature
//! directions, for interpretability research. The crate is the training
//! orchestration core: bounded-memory streaming generation interleaved with
//! mini-batch training, plus dead-feature resampling that leaves optimizer
//! state for unaffected parameters untouched.
//!
//! ## Architecture
//!
//! - `autoencoder`: tied-bias linear SAE with unit-norm decoder columns
//! - `loss`: L1 sparsity + MSE reconstruction composite loss
//! - `optimizer`: Adam with per-feature moment resets
//! - `store`: fixed-capacity activation buffer with shuffled batch sampling
//! - `resampler`: dead-feature detection and replacement
//! - `source`: activation-source seam (the hooked model forward pass lives
//!   behind this trait) plus a synthetic implementation
//! - `metrics`: best-effort metric-sink seam
//! - `pipeline`: the generate→train→resample orchestrator
//! - `config`: run hyperparameters, JSON-loadable
//! - `error`: typed taxonomy for the conditions callers must distinguish

pub mod autoencoder;
pub mod config;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod pipeline;
pub mod resampler;
pub mod source;
pub mod store;

pub use autoencoder::{geometric_median, SparseAutoencoder};
pub use config::TrainingConfig;
pub use error::SaeError;
pub use loss::{sae_training_loss, LossOutput};
pub use metrics::{MetricSink, NullSink, TracingSink};
pub use optimizer::{AdamWithReset, NamedParam};
pub use pipeline::{Checkpoint, Pipeline, PipelinePhase, RunProgress};
pub use resampler::{ActivationResampler, FeatureReplacements};
pub use source::{ActivationSource, SyntheticSource};
pub use store::ActivationStore;
