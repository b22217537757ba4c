//! Device enumeration for GPU telemetry

use crate::catalog::GpuMetricFamilies;
use crate::config::GpuMetricsConfig;
use crate::sampler::{Sampler, SamplerHandle};

use prometheus::{Counter, Gauge};
use std::sync::Arc;
use telemetry_gpu::{DeviceHandle, GpuBackend};
use tracing::{debug, info, warn};

/// Identity used when the backend cannot report a device UUID
pub const UNKNOWN_UUID: &str = "unknown";

/// A device tracked by the GPU sampler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    /// Compute-runtime ordinal the device was discovered at
    pub index: u32,

    /// Hardware-reported UUID, or [`UNKNOWN_UUID`]
    pub uuid: String,

    /// Management handle used for sampling
    pub handle: DeviceHandle,
}

/// The label-scoped series of one device
#[derive(Debug, Clone)]
pub(crate) struct DeviceSeries {
    pub utilization: Gauge,
    pub memory_total_bytes: Gauge,
    pub memory_used_bytes: Gauge,
    pub power_usage: Gauge,
    pub power_limit: Gauge,
    pub energy_consumption: Counter,
}

impl DeviceSeries {
    fn new(families: &GpuMetricFamilies, uuid: &str) -> Self {
        let labels = [uuid];
        Self {
            utilization: families.utilization.with_label_values(&labels),
            memory_total_bytes: families.memory_total_bytes.with_label_values(&labels),
            memory_used_bytes: families.memory_used_bytes.with_label_values(&labels),
            power_usage: families.power_usage.with_label_values(&labels),
            power_limit: families.power_limit.with_label_values(&labels),
            energy_consumption: families.energy_consumption.with_label_values(&labels),
        }
    }
}

/// A device together with the series the sampler writes for it
#[derive(Debug, Clone)]
pub(crate) struct TrackedDevice {
    pub info: GpuDevice,
    pub series: DeviceSeries,
}

/// Outcome of a successful hardware initialization
#[derive(Debug, Default)]
pub(crate) struct HardwareMetrics {
    pub devices: Vec<GpuDevice>,
    pub sampler: Option<SamplerHandle>,
}

/// Initialize the management API, register every usable device and start the sampler.
///
/// Returns `None` when GPU metrics are unavailable. Devices that fail to resolve
/// are skipped; with no usable device the sampler is not started.
pub(crate) fn initialize_hardware_metrics(
    backend: &Arc<dyn GpuBackend>,
    families: &GpuMetricFamilies,
    config: &GpuMetricsConfig,
) -> Option<HardwareMetrics> {
    if let Err(e) = backend.initialize() {
        warn!("failed to initialize, GPU metrics will not be available: {}", e);
        return None;
    }

    let tracked = match enumerate_devices(backend.as_ref(), families) {
        Ok(tracked) => tracked,
        Err(e) => {
            warn!("failed to get device count, GPU metrics will not be available: {}", e);
            return None;
        }
    };

    let devices: Vec<GpuDevice> = tracked.iter().map(|d| d.info.clone()).collect();
    if tracked.is_empty() {
        info!("No usable GPUs found, GPU sampler not started");
        return Some(HardwareMetrics::default());
    }

    let sampler = Sampler::new(Arc::clone(backend), tracked, config.failure_threshold);
    let sampler = match sampler.spawn(config.poll_interval()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("failed to start GPU sampler thread: {}", e);
            None
        }
    };

    Some(HardwareMetrics { devices, sampler })
}

/// Resolve every compute device and create its series.
///
/// Fails only if the device count cannot be read.
pub(crate) fn enumerate_devices(
    backend: &dyn GpuBackend,
    families: &GpuMetricFamilies,
) -> telemetry_gpu::Result<Vec<TrackedDevice>> {
    let count = backend.device_count()?;
    debug!("Enumerating {} GPUs through {} backend", count, backend.backend_name());

    let tracked: Vec<TrackedDevice> = (0..count)
        .filter_map(|index| resolve_device(backend, index))
        .map(|info| {
            let series = DeviceSeries::new(families, &info.uuid);
            TrackedDevice { info, series }
        })
        .collect();

    if (tracked.len() as u32) < count {
        warn!(
            "GPU metrics available for {} of {} devices",
            tracked.len(),
            count
        );
    }

    Ok(tracked)
}

fn resolve_device(backend: &dyn GpuBackend, index: u32) -> Option<GpuDevice> {
    let properties = match backend.device_properties(index) {
        Ok(properties) => properties,
        Err(e) => {
            warn!(
                "failed to get device properties for device {}, GPU metrics will not be available for this device: {}",
                index, e
            );
            return None;
        }
    };
    debug!(
        "GPU {} compute capability {}.{}",
        index, properties.compute_capability.0, properties.compute_capability.1
    );

    let bus_id = match backend.pci_bus_id(index) {
        Ok(bus_id) => bus_id,
        Err(e) => {
            warn!(
                "failed to get Bus ID for device {}, GPU metrics will not be available for this device: {}",
                index, e
            );
            return None;
        }
    };

    let handle = match backend.handle_by_pci_bus_id(&bus_id) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(
                "failed to get device from Bus ID {}, GPU metrics will not be available for this device: {}",
                bus_id, e
            );
            return None;
        }
    };

    match backend.name(handle) {
        Ok(name) => info!("Collecting metrics for GPU {}: {}", index, name),
        Err(_) => info!("Collecting metrics for GPU {}", index),
    }

    let uuid = backend.uuid(handle).unwrap_or_else(|e| {
        warn!("failed to get UUID for GPU {}, tracking it as {}: {}", index, UNKNOWN_UUID, e);
        UNKNOWN_UUID.to_string()
    });

    Some(GpuDevice {
        index,
        uuid,
        handle,
    })
}
