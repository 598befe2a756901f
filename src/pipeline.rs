//! Training pipeline orchestrator
//!
//! Drives the generate → train → maybe-resample cycle against a fixed
//! activation budget:
//!
//! 1. `Generating`: pull activation batches from the source into the store
//!    until it holds `min(capacity, remaining budget)` vectors.
//! 2. `Training`: one shuffled pass over the store in mini-batches —
//!    forward, loss (checked finite every step), backward, Adam step,
//!    decoder renormalization, metric emission — then clear the store.
//! 3. `Resampling`: when the cumulative activation count crosses a
//!    `resample_frequency` boundary, probe with freshly generated
//!    activations and resurrect dead features, synchronously, between
//!    training steps.
//! 4. `Done`: once `max_activations` have been processed.
//!
//! A non-finite loss or gradient is fatal and halts the run; the error
//! reports cumulative progress so the caller can resume from its last
//! external checkpoint. Source failures propagate unchanged (retry policy
//! lives in the model/data layer). The run is cooperatively stoppable at
//! phase boundaries only, never mid-batch.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::autoencoder::{geometric_median, SparseAutoencoder};
use crate::config::TrainingConfig;
use crate::error::SaeError;
use crate::loss::sae_training_loss;
use crate::metrics::MetricSink;
use crate::optimizer::AdamWithReset;
use crate::resampler::ActivationResampler;
use crate::source::ActivationSource;
use crate::store::ActivationStore;

/// Phase of the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Generating,
    Training,
    Resampling,
    Done,
}

/// Cumulative run counters. Monotonic; mutated only by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    /// Activations trained on so far. Drives both termination and
    /// resampling scheduling.
    pub activations_processed: u64,
    /// Training steps taken.
    pub steps: u64,
    /// Completed generate→train cycles.
    pub cycles: u64,
    /// Activation count at each resampling event, in order.
    pub resample_events: Vec<u64>,
}

/// Everything an external checkpointer needs to persist a run.
pub struct Checkpoint {
    /// Autoencoder parameters by name.
    pub parameters: Vec<(String, Tensor)>,
    /// Optimizer moments: `(name, first_moment, second_moment)`.
    pub optimizer_state: Vec<(String, Tensor, Tensor)>,
}

/// Sparse autoencoder training pipeline. Owns its model, optimizer state,
/// store and counters exclusively; one instance per run.
#[derive(Debug)]
pub struct Pipeline<S: ActivationSource, M: MetricSink> {
    config: TrainingConfig,
    model: SparseAutoencoder,
    optimizer: AdamWithReset,
    store: ActivationStore,
    resampler: ActivationResampler,
    source: S,
    metrics: M,
    rng: StdRng,
    progress: RunProgress,
    /// Activation count at which resampling last ran.
    last_resample: u64,
    phase: PipelinePhase,
    device: Device,
}

/// Activations drawn up front to seed the tied bias near the data's
/// geometric median.
const TIED_BIAS_SAMPLE: usize = 256;

impl<S: ActivationSource, M: MetricSink> Pipeline<S, M> {
    /// Build a pipeline, seeding the tied bias from the geometric median of
    /// an initial sample drawn from the source.
    pub fn new(config: TrainingConfig, source: S, metrics: M, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut source = source;
        let sample = source
            .next_activations(TIED_BIAS_SAMPLE.min(config.max_store_size))
            .context("drawing tied-bias seeding sample")?;
        let rows = sample.to_vec2::<f32>()?;
        let median = geometric_median(&rows, 100, 1e-6);
        Self::with_tied_bias_seed(config, source, metrics, device, &median)
    }

    /// Build a pipeline with an explicit tied-bias reference vector
    /// (e.g. a geometric median computed offline over a larger sample).
    pub fn with_tied_bias_seed(
        config: TrainingConfig,
        source: S,
        metrics: M,
        device: &Device,
        tied_bias_seed: &[f32],
    ) -> Result<Self> {
        config.validate()?;
        if source.d_in() != config.n_input_features {
            return Err(SaeError::InvalidConfig(format!(
                "source produces {}-wide vectors but config expects n_input_features = {}",
                source.d_in(),
                config.n_input_features
            ))
            .into());
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let model = SparseAutoencoder::new(
            config.n_input_features,
            config.n_learned_features(),
            tied_bias_seed,
            &mut rng,
            device,
        )?;
        let optimizer = AdamWithReset::new(
            model.named_parameters(),
            config.learning_rate,
            config.adam_beta1,
            config.adam_beta2,
            config.adam_epsilon,
        )?;
        let store = ActivationStore::new(config.max_store_size, config.n_input_features);
        let resampler = ActivationResampler::new(config.dead_feature_threshold as f32);

        info!(
            "pipeline ready: d_in={}, d_learned={}, store capacity={}, budget={} activations",
            config.n_input_features,
            config.n_learned_features(),
            config.max_store_size,
            config.max_activations
        );

        Ok(Self {
            config,
            model,
            optimizer,
            store,
            resampler,
            source,
            metrics,
            rng,
            progress: RunProgress::default(),
            last_resample: 0,
            phase: PipelinePhase::Generating,
            device: device.clone(),
        })
    }

    /// Current phase of the state machine.
    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// Cumulative counters.
    pub fn progress(&self) -> &RunProgress {
        &self.progress
    }

    /// The configuration this pipeline was built with.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// The autoencoder being trained.
    pub fn model(&self) -> &SparseAutoencoder {
        &self.model
    }

    /// Snapshot the model parameters and optimizer moments for external
    /// persistence. The pipeline never writes to durable storage itself.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            parameters: self.model.parameters(),
            optimizer_state: self.optimizer.state(),
        }
    }

    /// Run until the activation budget is consumed. Returns the final
    /// counters.
    pub fn run(&mut self) -> Result<RunProgress> {
        self.run_with_stop(|| false)
    }

    /// Run until the budget is consumed or `should_stop` returns true.
    /// The stop signal is checked at phase boundaries only; an in-flight
    /// training pass or resampling event always completes.
    pub fn run_with_stop(&mut self, should_stop: impl Fn() -> bool) -> Result<RunProgress> {
        while self.progress.activations_processed < self.config.max_activations {
            if should_stop() {
                info!(
                    "stop requested after {} activations, {} steps",
                    self.progress.activations_processed, self.progress.steps
                );
                return Ok(self.progress.clone());
            }

            self.phase = PipelinePhase::Generating;
            self.fill_store()?;

            self.phase = PipelinePhase::Training;
            self.train_pass()?;
            self.store.clear();
            self.progress.cycles += 1;

            if self.progress.activations_processed >= self.config.max_activations {
                break;
            }
            if self.progress.activations_processed
                >= self.last_resample + self.config.resample_frequency
            {
                self.phase = PipelinePhase::Resampling;
                self.run_resampling()?;
                self.last_resample = self.progress.activations_processed;
            }
        }

        self.phase = PipelinePhase::Done;
        info!(
            "run complete: {} activations, {} steps, {} cycles, {} resampling events",
            self.progress.activations_processed,
            self.progress.steps,
            self.progress.cycles,
            self.progress.resample_events.len()
        );
        Ok(self.progress.clone())
    }

    /// Fill the store up to `min(capacity, remaining budget)` vectors.
    fn fill_store(&mut self) -> Result<()> {
        let remaining = self.config.max_activations - self.progress.activations_processed;
        let target = (self.store.capacity() as u64).min(remaining) as usize;
        while self.store.len() < target {
            let n = self
                .config
                .source_data_batch_size
                .min(target - self.store.len());
            let batch = self
                .source
                .next_activations(n)
                .context("activation source failed during generation")?;
            self.store.append(&batch)?;
        }
        Ok(())
    }

    /// One full shuffled pass over the store.
    fn train_pass(&mut self) -> Result<()> {
        let batches = self.store.sample_batches(
            self.config.train_batch_size,
            &mut self.rng,
            &self.device,
        );
        for batch in batches {
            let batch = batch?;
            let batch_len = batch.dim(0)? as u64;

            let (learned, reconstruction) = self.model.forward(&batch)?;
            let loss = sae_training_loss(
                &batch,
                &learned,
                &reconstruction,
                self.config.l1_coefficient,
            )?;
            if !loss.total_value.is_finite() {
                return Err(SaeError::NonFiniteLoss {
                    step: self.progress.steps,
                    activations_processed: self.progress.activations_processed,
                }
                .into());
            }

            let grads = loss.total.backward()?;
            self.optimizer.step(&grads).with_context(|| {
                format!(
                    "optimizer failure at step {} ({} activations processed)",
                    self.progress.steps, self.progress.activations_processed
                )
            })?;
            self.model.renormalize_decoder()?;

            self.progress.steps += 1;
            self.progress.activations_processed += batch_len;

            let mut step_metrics: Vec<(&str, f64)> = loss.breakdown().to_vec();
            step_metrics.push((
                "progress/activations",
                self.progress.activations_processed as f64,
            ));
            self.metrics.record(self.progress.steps, &step_metrics);
        }
        Ok(())
    }

    /// One synchronous resampling event on a freshly generated probe batch.
    fn run_resampling(&mut self) -> Result<()> {
        let probe = self
            .source
            .next_activations(self.config.resample_probe_size)
            .context("activation source failed during resampling probe")?;
        let n_dead = self
            .resampler
            .resample(&probe, &self.model, &mut self.optimizer, &mut self.rng)
            .with_context(|| {
                format!(
                    "resampling failure ({} activations processed)",
                    self.progress.activations_processed
                )
            })?;

        self.progress
            .resample_events
            .push(self.progress.activations_processed);
        info!(
            "resampling at {} activations: {} dead features replaced",
            self.progress.activations_processed, n_dead
        );
        self.metrics.record(
            self.progress.steps,
            &[
                ("resample/n_dead", n_dead as f64),
                (
                    "resample/activations",
                    self.progress.activations_processed as f64,
                ),
            ],
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullSink;
    use crate::source::SyntheticSource;

    fn tiny_config() -> TrainingConfig {
        TrainingConfig {
            n_input_features: 4,
            expansion_factor: 2,
            l1_coefficient: 1e-3,
            learning_rate: 1e-3,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            train_batch_size: 4,
            max_store_size: 16,
            max_activations: 64,
            resample_frequency: 32,
            resample_probe_size: 16,
            source_data_batch_size: 8,
            dead_feature_threshold: 0.0,
            seed: 42,
        }
    }

    #[test]
    fn test_phase_starts_generating_and_ends_done() {
        let device = Device::Cpu;
        let source = SyntheticSource::new(4, 6, 1, &device);
        let mut pipeline =
            Pipeline::new(tiny_config(), source, NullSink, &device).unwrap();
        assert_eq!(pipeline.phase(), PipelinePhase::Generating);
        pipeline.run().unwrap();
        assert_eq!(pipeline.phase(), PipelinePhase::Done);
    }

    #[test]
    fn test_source_width_mismatch_rejected() {
        let device = Device::Cpu;
        let source = SyntheticSource::new(6, 6, 1, &device);
        let err = Pipeline::new(tiny_config(), source, NullSink, &device).unwrap_err();
        assert!(err.to_string().contains("n_input_features"));
    }

    #[test]
    fn test_stop_signal_halts_before_completion() {
        let device = Device::Cpu;
        let source = SyntheticSource::new(4, 6, 1, &device);
        let mut pipeline =
            Pipeline::new(tiny_config(), source, NullSink, &device).unwrap();
        let progress = pipeline.run_with_stop(|| true).unwrap();
        assert_eq!(progress.activations_processed, 0);
        assert_ne!(pipeline.phase(), PipelinePhase::Done);
    }

    #[test]
    fn test_checkpoint_exposes_parameters_and_moments() {
        let device = Device::Cpu;
        let source = SyntheticSource::new(4, 6, 1, &device);
        let mut pipeline =
            Pipeline::new(tiny_config(), source, NullSink, &device).unwrap();
        pipeline.run().unwrap();
        let checkpoint = pipeline.checkpoint();
        let names: Vec<&str> = checkpoint
            .parameters
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(names, vec!["b_tied", "w_enc", "b_enc", "w_dec"]);
        assert_eq!(checkpoint.optimizer_state.len(), 4);
    }

    /// Source that produces values large enough to overflow the squared
    /// reconstruction error to infinity.
    struct ExplodingSource {
        calls: usize,
    }

    impl ActivationSource for ExplodingSource {
        fn d_in(&self) -> usize {
            4
        }
        fn next_activations(&mut self, n: usize) -> Result<Tensor> {
            // First call seeds the tied bias with zeros; later calls explode.
            let value = if self.calls == 0 { 0.0f32 } else { 1e20 };
            self.calls += 1;
            Ok(Tensor::from_vec(
                vec![value; n * 4],
                (n, 4),
                &Device::Cpu,
            )?)
        }
    }

    #[test]
    fn test_non_finite_loss_is_fatal() {
        let device = Device::Cpu;
        let mut pipeline = Pipeline::new(
            tiny_config(),
            ExplodingSource { calls: 0 },
            NullSink,
            &device,
        )
        .unwrap();
        let err = pipeline.run().unwrap_err();
        let sae_err = err
            .downcast_ref::<SaeError>()
            .expect("fatal error should be a typed SaeError");
        assert!(matches!(sae_err, SaeError::NonFiniteLoss { .. }));
    }
}
