//! # telemetry-metrics
//!
//! Process-wide telemetry for an inference server.
//!
//! This crate provides:
//! - The fixed catalog of request-outcome and latency counters
//! - Per-device GPU gauges fed by a background sampler thread
//! - A per-(device, metric) circuit breaker that stops polling metrics that keep failing
//! - Idempotent, thread-safe enablement of business and GPU metrics
//! - A registry facade rendering every series in the Prometheus text format
//!
//! ## Example
//!
//! ```rust,no_run
//! use telemetry_metrics::{Metrics, MetricsConfig, ModelReporter};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metrics = Metrics::new(MetricsConfig::load()?)?;
//!     metrics.enable_metrics();
//!     metrics.enable_gpu_metrics();
//!
//!     if let Some(reporter) = ModelReporter::create(&metrics, "resnet50", "1", Some(0)) {
//!         reporter.record_execution(8);
//!         reporter.record_success();
//!         reporter.add_request_duration_us(1250);
//!     }
//!
//!     println!("{}", metrics.serialized_metrics()?);
//!     metrics.shutdown();
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod discovery;
pub mod prometheus_metrics;
pub mod registry;
pub mod reporter;
pub mod sampler;

// Re-export commonly used types
pub use catalog::{GpuMetricFamilies, InferenceMetrics, GPU_UUID_LABEL, MODEL_LABELS};
pub use crate::config::{GpuMetricsConfig, LoggingConfig, MetricsConfig};
pub use discovery::GpuDevice;
pub use prometheus_metrics::PrometheusExporter;
pub use registry::{global, Metrics};
pub use reporter::ModelReporter;
pub use sampler::MetricKind;

use tracing_subscriber::EnvFilter;

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] ::config::ConfigError),

    #[error("GPU error: {0}")]
    Gpu(#[from] telemetry_gpu::GpuError),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this more than once is a no-op.
pub fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.show_target);

    let _ = if logging.json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Arc;
    use telemetry_gpu::{GpuBackend, MockGpuBackend};
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    /// Setup test logging with appropriate levels
    pub fn setup_test_logging() {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "telemetry_metrics=debug,telemetry_gpu=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    }

    /// A mock backend shared between the test and the code under test
    pub fn mock_backend(count: u32) -> (Arc<MockGpuBackend>, Arc<dyn GpuBackend>) {
        let mock = Arc::new(MockGpuBackend::new(count));
        let backend: Arc<dyn GpuBackend> = mock.clone();
        (mock, backend)
    }

    /// Value of the series of `family` whose labels contain `label=value`
    pub fn sample_value(
        registry: &prometheus::Registry,
        family: &str,
        label: &str,
        value: &str,
    ) -> Option<f64> {
        registry
            .gather()
            .into_iter()
            .find(|f| f.get_name() == family)?
            .get_metric()
            .iter()
            .find(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == label && l.get_value() == value)
            })
            .map(|m| {
                if m.has_gauge() {
                    m.get_gauge().get_value()
                } else {
                    m.get_counter().get_value()
                }
            })
    }

    /// Number of series registered under `family`
    pub fn series_count(registry: &prometheus::Registry, family: &str) -> usize {
        registry
            .gather()
            .into_iter()
            .find(|f| f.get_name() == family)
            .map(|f| f.get_metric().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MetricsError::Config("bad interval".to_string());
        assert_eq!(error.to_string(), "Configuration error: bad interval");

        let error: MetricsError = telemetry_gpu::GpuError::NotInitialized.into();
        assert_eq!(error.to_string(), "GPU error: GPU backend not initialized");
    }

    #[test]
    fn test_init_logging_twice() {
        let logging = LoggingConfig::default();
        init_logging(&logging);
        init_logging(&logging);
    }
}
