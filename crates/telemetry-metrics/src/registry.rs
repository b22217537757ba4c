//! Process-wide metrics context: registry facade and lifecycle gate

use crate::catalog::{GpuMetricFamilies, InferenceMetrics};
use crate::config::MetricsConfig;
use crate::discovery::{initialize_hardware_metrics, GpuDevice, HardwareMetrics};
use crate::prometheus_metrics::PrometheusExporter;
use crate::{MetricsError, Result};

use parking_lot::Mutex;
use prometheus::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use telemetry_gpu::{create_gpu_backend, GpuBackend, GpuBackendKind};
use tracing::{debug, error, info, warn};

/// GPU telemetry state, written only under the enable lock
#[derive(Debug)]
enum GpuLifecycle {
    Uninitialized,
    Enabled(HardwareMetrics),
}

/// Telemetry context shared by every component of the server
pub struct Metrics {
    config: MetricsConfig,
    registry: Registry,
    exporter: PrometheusExporter,
    inference: InferenceMetrics,
    gpu_families: GpuMetricFamilies,
    backend: Option<Arc<dyn GpuBackend>>,

    metrics_enabled: AtomicBool,
    gpu_enabled: AtomicBool,
    /// Management API initialized and devices counted
    hardware_ready: AtomicBool,

    gpu: Mutex<GpuLifecycle>,
}

impl Metrics {
    /// Create a context using the backend named by the configuration
    pub fn new(config: MetricsConfig) -> Result<Self> {
        config.validate()?;

        let backend = if config.gpu.supported && config.gpu.backend != GpuBackendKind::None {
            match create_gpu_backend(&config.gpu.backend) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    warn!("GPU backend unavailable, GPU metrics will not be available: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self::build(config, backend)
    }

    /// Create a context around an existing backend
    pub fn with_backend(config: MetricsConfig, backend: Arc<dyn GpuBackend>) -> Result<Self> {
        config.validate()?;
        Self::build(config, Some(backend))
    }

    fn build(config: MetricsConfig, backend: Option<Arc<dyn GpuBackend>>) -> Result<Self> {
        let registry = Registry::new();
        let inference = InferenceMetrics::new()?;
        let gpu_families = GpuMetricFamilies::new()?;

        if config.metrics_supported {
            inference.register(&registry).map_err(|e| {
                MetricsError::Registry(format!("Failed to register inference metrics: {}", e))
            })?;
        }

        if config.gpu.supported {
            gpu_families.register(&registry).map_err(|e| {
                MetricsError::Registry(format!("Failed to register GPU metrics: {}", e))
            })?;
        }

        debug!(
            "Created metrics context (metrics supported: {}, GPU metrics supported: {})",
            config.metrics_supported, config.gpu.supported
        );

        Ok(Self {
            config,
            registry,
            exporter: PrometheusExporter::new(),
            inference,
            gpu_families,
            backend,
            metrics_enabled: AtomicBool::new(false),
            gpu_enabled: AtomicBool::new(false),
            hardware_ready: AtomicBool::new(false),
            gpu: Mutex::new(GpuLifecycle::Uninitialized),
        })
    }

    /// The configuration this context was built with
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Whether business metrics are active
    pub fn enabled(&self) -> bool {
        self.metrics_enabled.load(Ordering::Acquire)
    }

    /// Mark business metrics active
    pub fn enable_metrics(&self) {
        if !self.config.metrics_supported {
            return;
        }
        if !self.metrics_enabled.swap(true, Ordering::AcqRel) {
            info!("Metrics enabled");
        }
    }

    /// Whether GPU metrics have been enabled
    pub fn gpu_metrics_enabled(&self) -> bool {
        self.gpu_enabled.load(Ordering::Acquire)
    }

    /// Discover devices and start the sampler.
    ///
    /// Runs discovery at most once no matter how many callers race here. Failures,
    /// and builds without GPU support, leave GPU metrics without devices but still
    /// mark them enabled.
    pub fn enable_gpu_metrics(&self) {
        if !self.config.gpu.supported {
            self.gpu_enabled.store(true, Ordering::Release);
            return;
        }

        let mut state = self.gpu.lock();
        if self.gpu_enabled.load(Ordering::Acquire) {
            return;
        }

        let hardware = if self.config.gpu.cpu_only() {
            info!(
                "{} is set, skipping GPU metrics collection",
                self.config.gpu.cpu_only_env
            );
            HardwareMetrics::default()
        } else if let Some(backend) = &self.backend {
            match initialize_hardware_metrics(backend, &self.gpu_families, &self.config.gpu) {
                Some(hardware) => {
                    self.hardware_ready.store(true, Ordering::Release);
                    hardware
                }
                None => HardwareMetrics::default(),
            }
        } else {
            debug!("No GPU backend available, GPU metrics not collected");
            HardwareMetrics::default()
        };

        *state = GpuLifecycle::Enabled(hardware);
        self.gpu_enabled.store(true, Ordering::Release);
    }

    /// Devices tracked by the sampler
    pub fn gpu_devices(&self) -> Vec<GpuDevice> {
        match &*self.gpu.lock() {
            GpuLifecycle::Enabled(hardware) => hardware.devices.clone(),
            GpuLifecycle::Uninitialized => Vec::new(),
        }
    }

    /// Whether the sampler thread is running
    pub fn sampler_running(&self) -> bool {
        match &*self.gpu.lock() {
            GpuLifecycle::Enabled(HardwareMetrics {
                sampler: Some(sampler),
                ..
            }) => sampler.is_running(),
            _ => false,
        }
    }

    /// Business metric families
    pub fn inference(&self) -> &InferenceMetrics {
        &self.inference
    }

    /// The registry every family is registered with
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered series in the Prometheus text format
    pub fn serialized_metrics(&self) -> Result<String> {
        self.exporter.export(&self.registry)
    }

    /// UUID of the device at compute-runtime ordinal `cuda_device`.
    ///
    /// Returns `None` when GPU metrics are not enabled or any hardware call fails.
    pub fn uuid_for_cuda_device(&self, cuda_device: i32) -> Option<String> {
        if !self.gpu_enabled.load(Ordering::Acquire)
            || !self.hardware_ready.load(Ordering::Acquire)
        {
            return None;
        }
        let backend = self.backend.as_ref()?;

        let index = match u32::try_from(cuda_device) {
            Ok(index) => index,
            Err(_) => {
                error!("invalid CUDA device {}", cuda_device);
                return None;
            }
        };

        let bus_id = match backend.pci_bus_id(index) {
            Ok(bus_id) => bus_id,
            Err(e) => {
                error!("failed to get PCI Bus ID for CUDA device {}: {}", cuda_device, e);
                return None;
            }
        };

        let handle = match backend.handle_by_pci_bus_id(&bus_id) {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to get device from PCI Bus ID: {}", e);
                return None;
            }
        };

        match backend.uuid(handle) {
            Ok(uuid) => Some(uuid),
            Err(e) => {
                error!("failed to get device UUID: {}", e);
                None
            }
        }
    }

    /// Stop the sampler and wait for it to exit
    pub fn shutdown(&self) {
        let mut state = self.gpu.lock();
        if let GpuLifecycle::Enabled(hardware) = &mut *state {
            if let Some(mut sampler) = hardware.sampler.take() {
                sampler.stop();
            }
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("config", &self.config)
            .field("backend", &self.backend.as_ref().map(|b| b.backend_name()))
            .field("metrics_enabled", &self.enabled())
            .field("gpu_enabled", &self.gpu_metrics_enabled())
            .finish()
    }
}

impl Drop for Metrics {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static GLOBAL: OnceLock<Metrics> = OnceLock::new();

/// The process-wide context, built from the loaded configuration on first use.
///
/// The context lives in a static and is never dropped, so its sampler is not
/// stopped automatically. Call `global().shutdown()` before the process exits.
pub fn global() -> &'static Metrics {
    GLOBAL.get_or_init(|| {
        let config = MetricsConfig::load().unwrap_or_else(|e| {
            warn!("failed to load metrics configuration, using defaults: {}", e);
            MetricsConfig::default()
        });

        Metrics::new(config).unwrap_or_else(|e| {
            error!("failed to create metrics, all metrics disabled: {}", e);
            Metrics::disabled()
        })
    })
}

impl Metrics {
    /// A context with every capability switched off
    fn disabled() -> Self {
        Self {
            config: MetricsConfig::disabled(),
            registry: Registry::new(),
            exporter: PrometheusExporter::new(),
            inference: InferenceMetrics::default(),
            gpu_families: GpuMetricFamilies::default(),
            backend: None,
            metrics_enabled: AtomicBool::new(false),
            gpu_enabled: AtomicBool::new(false),
            hardware_ready: AtomicBool::new(false),
            gpu: Mutex::new(GpuLifecycle::Uninitialized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{mock_backend, sample_value, series_count, setup_test_logging};
    use serial_test::serial;
    use std::time::Duration;
    use telemetry_gpu::mock::mock_uuid;
    use telemetry_gpu::{MockGpuBackend, MockMetric};

    fn test_config() -> MetricsConfig {
        MetricsConfig::default()
            .with_gpu_backend(GpuBackendKind::Mock)
            .with_poll_interval(Duration::from_millis(20))
            .with_cpu_only_env("TELEMETRY_TEST_REGISTRY_UNSET")
    }

    fn metrics_with(count: u32) -> (Arc<MockGpuBackend>, Metrics) {
        setup_test_logging();
        let (mock, backend) = mock_backend(count);
        let metrics = Metrics::with_backend(test_config(), backend).unwrap();
        (mock, metrics)
    }

    #[test]
    fn test_enable_metrics_is_idempotent() {
        let (_mock, metrics) = metrics_with(1);
        assert!(!metrics.enabled());

        metrics.enable_metrics();
        metrics.enable_metrics();
        assert!(metrics.enabled());
    }

    #[test]
    fn test_concurrent_gpu_enable_runs_discovery_once() {
        let (mock, metrics) = metrics_with(2);

        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| metrics.enable_gpu_metrics());
            }
        });

        assert!(metrics.gpu_metrics_enabled());
        assert_eq!(mock.initialize_calls(), 1);
        assert_eq!(mock.reads(0, MockMetric::Properties), 1);
        assert_eq!(mock.reads(1, MockMetric::Properties), 1);
        assert_eq!(series_count(metrics.registry(), "nv_gpu_power_limit"), 2);
        assert_eq!(metrics.gpu_devices().len(), 2);
        assert!(metrics.sampler_running());

        metrics.enable_gpu_metrics();
        assert_eq!(mock.initialize_calls(), 1);
        metrics.shutdown();
    }

    #[test]
    fn test_sampler_feeds_registry() {
        let (mock, metrics) = metrics_with(1);
        mock.set_power_usage(0, 180_000);
        metrics.enable_gpu_metrics();

        let uuid = mock_uuid(0);
        let mut waited = Duration::ZERO;
        while sample_value(metrics.registry(), "nv_gpu_power_usage", "gpu_uuid", &uuid)
            != Some(180.0)
        {
            assert!(waited < Duration::from_secs(5), "sampler never reported");
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }

        let text = metrics.serialized_metrics().unwrap();
        assert!(text.contains(&format!(r#"nv_gpu_power_usage{{gpu_uuid="{}"}} 180"#, uuid)));
        metrics.shutdown();
    }

    #[test]
    #[serial]
    fn test_cpu_only_override_skips_discovery() {
        setup_test_logging();
        let (mock, backend) = mock_backend(2);
        let config = test_config().with_cpu_only_env("TELEMETRY_TEST_REGISTRY_CPU_ONLY");
        let metrics = Metrics::with_backend(config, backend).unwrap();
        std::env::set_var("TELEMETRY_TEST_REGISTRY_CPU_ONLY", "1");

        metrics.enable_gpu_metrics();
        metrics.enable_gpu_metrics();
        std::env::remove_var("TELEMETRY_TEST_REGISTRY_CPU_ONLY");

        assert!(metrics.gpu_metrics_enabled());
        assert!(metrics.gpu_devices().is_empty());
        assert!(!metrics.sampler_running());
        assert_eq!(mock.initialize_calls(), 0);
        assert_eq!(series_count(metrics.registry(), "nv_gpu_utilization"), 0);
        assert_eq!(metrics.uuid_for_cuda_device(0), None);
    }

    #[test]
    fn test_uuid_lookup_before_enable() {
        let (mock, metrics) = metrics_with(2);
        assert_eq!(metrics.uuid_for_cuda_device(0), None);
        assert_eq!(mock.reads(0, MockMetric::PciBusId), 0);
    }

    #[test]
    fn test_uuid_lookup() {
        let (mock, metrics) = metrics_with(2);
        metrics.enable_gpu_metrics();

        assert_eq!(metrics.uuid_for_cuda_device(1), Some(mock_uuid(1)));
        assert_eq!(metrics.uuid_for_cuda_device(2), None);
        assert_eq!(metrics.uuid_for_cuda_device(-1), None);

        mock.fail_metric(0, MockMetric::Uuid);
        assert_eq!(metrics.uuid_for_cuda_device(0), None);
        metrics.shutdown();
    }

    #[test]
    fn test_initialize_failure_degrades() {
        let (mock, metrics) = metrics_with(2);
        mock.fail_initialize("driver not loaded");

        metrics.enable_gpu_metrics();
        assert!(metrics.gpu_metrics_enabled());
        assert!(metrics.gpu_devices().is_empty());
        assert!(!metrics.sampler_running());
        assert_eq!(metrics.uuid_for_cuda_device(0), None);

        // no retry on later calls
        metrics.enable_gpu_metrics();
        assert_eq!(mock.initialize_calls(), 1);
    }

    #[test]
    fn test_device_count_failure_degrades() {
        let (mock, metrics) = metrics_with(2);
        mock.fail_device_count("no devices");

        metrics.enable_gpu_metrics();
        assert!(metrics.gpu_devices().is_empty());
        assert!(!metrics.sampler_running());
        assert_eq!(metrics.uuid_for_cuda_device(0), None);
    }

    #[test]
    fn test_partial_enumeration() {
        let (mock, metrics) = metrics_with(3);
        mock.fail_metric(1, MockMetric::Handle);

        metrics.enable_gpu_metrics();
        let indices: Vec<u32> = metrics.gpu_devices().iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(metrics.sampler_running());
        metrics.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (mock, metrics) = metrics_with(1);
        metrics.enable_gpu_metrics();
        assert!(metrics.sampler_running());

        metrics.shutdown();
        assert!(!metrics.sampler_running());
        let reads = mock.reads(0, MockMetric::Utilization);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(mock.reads(0, MockMetric::Utilization), reads);

        metrics.shutdown();
    }

    #[test]
    fn test_unsupported_capabilities_are_no_ops() {
        setup_test_logging();
        let (mock, backend) = mock_backend(1);
        let config = MetricsConfig::disabled();
        let metrics = Metrics::with_backend(config, backend).unwrap();

        metrics.enable_metrics();
        metrics.enable_gpu_metrics();
        assert!(!metrics.enabled());
        assert_eq!(mock.initialize_calls(), 0);
        assert_eq!(metrics.uuid_for_cuda_device(0), None);
        assert!(metrics.serialized_metrics().unwrap().is_empty());
    }

    #[test]
    fn test_gpu_unsupported_still_marks_enabled() {
        setup_test_logging();
        let (mock, backend) = mock_backend(2);
        let config = test_config().with_gpu_supported(false);
        let metrics = Metrics::with_backend(config, backend).unwrap();
        assert!(!metrics.gpu_metrics_enabled());

        metrics.enable_gpu_metrics();
        metrics.enable_gpu_metrics();
        assert!(metrics.gpu_metrics_enabled());
        assert!(metrics.gpu_devices().is_empty());
        assert!(!metrics.sampler_running());
        assert_eq!(mock.initialize_calls(), 0);
        assert_eq!(metrics.uuid_for_cuda_device(0), None);
        assert_eq!(series_count(metrics.registry(), "nv_gpu_utilization"), 0);
    }

    #[test]
    #[serial]
    fn test_global_is_a_single_instance() {
        setup_test_logging();
        let first = global();
        let second = global();
        assert!(std::ptr::eq(first, second));

        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| global() as *const Metrics as usize))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), first as *const Metrics as usize);
        }

        first.shutdown();
        first.shutdown();
        assert!(!first.sampler_running());
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        let (_mock, metrics) = metrics_with(1);
        metrics.enable_metrics();
        let counter = metrics
            .inference()
            .request_success
            .with_label_values(&["m", "1", ""]);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        counter.inc();
                    }
                });
            }
        });

        assert_eq!(counter.get(), 8000);
        assert_eq!(
            sample_value(metrics.registry(), "nv_inference_request_success", "model", "m"),
            Some(8000.0)
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_mock, backend) = mock_backend(1);
        let config = test_config().with_failure_threshold(0);
        assert!(matches!(
            Metrics::with_backend(config, backend),
            Err(MetricsError::Config(_))
        ));
    }

    #[test]
    fn test_new_without_backend() {
        setup_test_logging();
        let config = MetricsConfig::default().with_gpu_backend(GpuBackendKind::None);
        let metrics = Metrics::new(config).unwrap();

        metrics.enable_gpu_metrics();
        assert!(metrics.gpu_metrics_enabled());
        assert!(metrics.gpu_devices().is_empty());
        assert_eq!(metrics.uuid_for_cuda_device(0), None);
    }
}
