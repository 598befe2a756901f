//! Metric sink seam
//!
//! Per-step losses and resampling statistics flow out through a sink the
//! caller injects; the engine never blocks on telemetry and a sink cannot
//! fail. Real deployments wrap an experiment tracker here.

use tracing::info;

/// Receives named scalar metrics, best-effort.
pub trait MetricSink {
    /// Record metrics for a training step or resampling event.
    fn record(&mut self, step: u64, metrics: &[(&str, f64)]);
}

/// Discards everything.
#[derive(Debug)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn record(&mut self, _step: u64, _metrics: &[(&str, f64)]) {}
}

/// Logs metrics through `tracing` every `interval` steps (resampling
/// metrics, which arrive between intervals, are always logged).
pub struct TracingSink {
    interval: u64,
}

impl TracingSink {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
        }
    }
}

impl MetricSink for TracingSink {
    fn record(&mut self, step: u64, metrics: &[(&str, f64)]) {
        let is_resample = metrics.iter().any(|(name, _)| name.starts_with("resample/"));
        if !is_resample && step % self.interval != 0 {
            return;
        }
        let rendered: Vec<String> = metrics
            .iter()
            .map(|(name, value)| format!("{name}={value:.6}"))
            .collect();
        info!("step {step}: {}", rendered.join(" "));
    }
}

/// Test helper: keeps everything it is given.
#[cfg(test)]
pub struct RecordingSink {
    pub records: Vec<(u64, Vec<(String, f64)>)>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

#[cfg(test)]
impl MetricSink for RecordingSink {
    fn record(&mut self, step: u64, metrics: &[(&str, f64)]) {
        self.records.push((
            step,
            metrics
                .iter()
                .map(|(name, value)| ((*name).to_string(), *value))
                .collect(),
        ));
    }
}
