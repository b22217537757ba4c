//! Hardware-management backend interface

use crate::config::GpuBackendKind;
use crate::{GpuError, Result};

use std::sync::Arc;
use tracing::{info, warn};

/// Opaque handle to a device resolved through the management API.
///
/// Handles are only meaningful to the backend that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

/// Properties of a compute-runtime device ordinal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Marketing name reported by the runtime
    pub name: String,
    /// Compute capability (major, minor)
    pub compute_capability: (u32, u32),
}

/// Framebuffer memory, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
}

/// Blocking interface over the vendor management and compute-runtime APIs.
///
/// No call carries a timeout; a hung driver call blocks the caller.
pub trait GpuBackend: Send + Sync {
    /// Initialize the management library
    fn initialize(&self) -> Result<()>;

    /// Number of compute-runtime devices
    fn device_count(&self) -> Result<u32>;

    /// Properties of a compute-runtime ordinal
    fn device_properties(&self, index: u32) -> Result<DeviceProperties>;

    /// PCI bus id of a compute-runtime ordinal
    fn pci_bus_id(&self, index: u32) -> Result<String>;

    /// Resolve a management handle from a PCI bus id
    fn handle_by_pci_bus_id(&self, bus_id: &str) -> Result<DeviceHandle>;

    /// Device name
    fn name(&self, device: DeviceHandle) -> Result<String>;

    /// Device UUID
    fn uuid(&self, device: DeviceHandle) -> Result<String>;

    /// Power management limit in milliwatts
    fn power_management_limit(&self, device: DeviceHandle) -> Result<u32>;

    /// Current power draw in milliwatts
    fn power_usage(&self, device: DeviceHandle) -> Result<u32>;

    /// Energy consumed since the driver was loaded, in millijoules
    fn total_energy_consumption(&self, device: DeviceHandle) -> Result<u64>;

    /// GPU utilization percentage (0-100) over the last sample period
    fn utilization_rates(&self, device: DeviceHandle) -> Result<u32>;

    /// Framebuffer memory
    fn memory_info(&self, device: DeviceHandle) -> Result<MemoryInfo>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Create a backend for the configured kind
pub fn create_gpu_backend(kind: &GpuBackendKind) -> Result<Arc<dyn GpuBackend>> {
    info!("Creating GPU backend: {}", kind);

    match kind {
        #[cfg(feature = "nvml")]
        GpuBackendKind::Nvml => Ok(Arc::new(crate::nvml::NvmlBackend::new())),

        #[cfg(any(feature = "mock", test))]
        GpuBackendKind::Mock => Ok(Arc::new(crate::mock::MockGpuBackend::new(2))),

        _ => {
            warn!("GPU backend {:?} not supported or feature not enabled", kind);
            Err(GpuError::UnsupportedBackend(kind.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_backend() {
        let backend = create_gpu_backend(&GpuBackendKind::Mock).unwrap();
        assert_eq!(backend.backend_name(), "mock");
        backend.initialize().unwrap();
        assert_eq!(backend.device_count().unwrap(), 2);
    }

    #[test]
    fn test_unsupported_backend() {
        let result = create_gpu_backend(&GpuBackendKind::None);
        assert!(matches!(result, Err(GpuError::UnsupportedBackend(ref name)) if name == "none"));
    }

    #[cfg(not(feature = "nvml"))]
    #[test]
    fn test_nvml_compiled_out() {
        assert!(create_gpu_backend(&GpuBackendKind::Nvml).is_err());
    }
}
