//! Metrics configuration
//!
//! `MetricsConfig` doubles as the capability object: it is resolved once at
//! startup and every operation consults it instead of relying on conditional
//! compilation.

use crate::{MetricsError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use telemetry_gpu::GpuBackendKind;

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "TELEMETRY_CONFIG";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "TELEMETRY";

/// Top-level metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Business metrics are available in this build
    pub metrics_supported: bool,

    /// GPU telemetry configuration
    pub gpu: GpuMetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// GPU telemetry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuMetricsConfig {
    /// GPU telemetry is available in this build
    pub supported: bool,

    /// Hardware-management backend
    pub backend: GpuBackendKind,

    /// Delay between sampler rounds, in milliseconds
    pub poll_interval_ms: u64,

    /// Consecutive failures after which a metric is no longer polled for a device
    pub failure_threshold: u32,

    /// Environment variable that, when present, marks the process CPU-only
    pub cpu_only_env: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Include the event target
    pub show_target: bool,
}

impl MetricsConfig {
    /// Load configuration with precedence:
    /// 1. Environment variables (`TELEMETRY_*`, nested keys joined by `__`)
    /// 2. File named by `TELEMETRY_CONFIG`
    /// 3. Defaults
    pub fn load() -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(::config::File::with_name(&path).required(false));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Configuration with every capability switched off
    pub fn disabled() -> Self {
        Self {
            metrics_supported: false,
            gpu: GpuMetricsConfig {
                supported: false,
                backend: GpuBackendKind::None,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_metrics_supported(mut self, supported: bool) -> Self {
        self.metrics_supported = supported;
        self
    }

    pub fn with_gpu_supported(mut self, supported: bool) -> Self {
        self.gpu.supported = supported;
        self
    }

    pub fn with_gpu_backend(mut self, backend: GpuBackendKind) -> Self {
        self.gpu.backend = backend;
        self
    }

    /// Set the sampler polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.gpu.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.gpu.failure_threshold = threshold;
        self
    }

    pub fn with_cpu_only_env(mut self, name: impl Into<String>) -> Self {
        self.gpu.cpu_only_env = name.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.gpu.validate()
    }
}

impl GpuMetricsConfig {
    /// Delay between sampler rounds
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Whether the CPU-only override is present in the environment
    pub fn cpu_only(&self) -> bool {
        std::env::var_os(&self.cpu_only_env).is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(MetricsError::Config(
                "Polling interval must be greater than zero".to_string(),
            ));
        }

        if self.failure_threshold == 0 {
            return Err(MetricsError::Config(
                "Failure threshold must be greater than zero".to_string(),
            ));
        }

        if self.cpu_only_env.is_empty() {
            return Err(MetricsError::Config(
                "CPU-only override variable name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            metrics_supported: true,
            gpu: GpuMetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for GpuMetricsConfig {
    fn default() -> Self {
        Self {
            supported: true,
            backend: GpuBackendKind::Nvml,
            poll_interval_ms: 2000,
            failure_threshold: 3,
            cpu_only_env: "TRITON_SERVER_CPU_ONLY".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            show_target: true,
        }
    }
}
