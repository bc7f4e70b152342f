//! Layer timing metrics.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Metric name for fetching a layer stream.
pub const DOWNLOAD: &str = "download";

/// Metric name for populating a volume from a layer stream.
pub const UNPACK: &str = "unpack";

/// Sink for per-layer durations.
pub trait MetricsEmitter: Send + Sync {
    /// Record the time elapsed since `start` for one layer.
    fn record_duration(&self, name: &str, layer: &str, start: Instant);
}

/// Emits durations as tracing events under the `kiln::metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsEmitter for TracingMetrics {
    fn record_duration(&self, name: &str, layer: &str, start: Instant) {
        let elapsed = start.elapsed();
        tracing::info!(
            target: "kiln::metrics",
            metric = name,
            layer,
            duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Layer timing"
        );
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsEmitter for NoopMetrics {
    fn record_duration(&self, _name: &str, _layer: &str, _start: Instant) {}
}

/// One recorded duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationSample {
    /// Metric name.
    pub name: String,
    /// Layer blob ID.
    pub layer: String,
    /// Measured duration.
    pub duration: Duration,
}

/// Keeps samples in memory, mostly for tests and `--timings` summaries.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    samples: Mutex<Vec<DurationSample>>,
}

impl InMemoryMetrics {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded samples.
    #[must_use]
    pub fn samples(&self) -> Vec<DurationSample> {
        self.samples.lock().clone()
    }

    /// Number of samples recorded under `name`.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.samples.lock().iter().filter(|s| s.name == name).count()
    }

    /// Total duration recorded under `name`.
    #[must_use]
    pub fn total(&self, name: &str) -> Duration {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.duration)
            .sum()
    }
}

impl MetricsEmitter for InMemoryMetrics {
    fn record_duration(&self, name: &str, layer: &str, start: Instant) {
        self.samples.lock().push(DurationSample {
            name: name.to_string(),
            layer: layer.to_string(),
            duration: start.elapsed(),
        });
    }
}
