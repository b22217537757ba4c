//! NVML (NVIDIA Management Library) backend

use crate::backend::{DeviceHandle, DeviceProperties, GpuBackend, MemoryInfo};
use crate::ordinal::{
    order_devices, parse_visible_devices, visible_ordinals, DeviceOrder, PhysicalDevice,
    DEVICE_ORDER_ENV, VISIBLE_DEVICES_ENV,
};
use crate::{GpuError, Result};

use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use std::sync::OnceLock;
use tracing::{debug, info};

/// NVML-backed hardware access.
///
/// Compute ordinals are derived from NVML devices using the CUDA rules for
/// `CUDA_DEVICE_ORDER` and `CUDA_VISIBLE_DEVICES`, resolved once per process.
pub struct NvmlBackend {
    nvml: OnceLock<Nvml>,
    ordinals: OnceLock<Vec<u32>>,
}

impl NvmlBackend {
    /// Create an uninitialized NVML backend; the library is loaded by `initialize`
    pub fn new() -> Self {
        Self {
            nvml: OnceLock::new(),
            ordinals: OnceLock::new(),
        }
    }

    fn nvml(&self) -> Result<&Nvml> {
        self.nvml.get().ok_or(GpuError::NotInitialized)
    }

    fn device(&self, handle: DeviceHandle) -> Result<Device<'_>> {
        self.nvml()?.device_by_index(handle.0).map_err(nvml_error)
    }

    /// NVML index of every compute ordinal
    fn ordinals(&self) -> Result<&[u32]> {
        if let Some(ordinals) = self.ordinals.get() {
            return Ok(ordinals);
        }

        let nvml = self.nvml()?;
        let count = nvml.device_count().map_err(runtime_error)?;
        let mut physical = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = nvml.device_by_index(index).map_err(runtime_error)?;
            let capability = device
                .cuda_compute_capability()
                .map(|c| (c.major, c.minor))
                .unwrap_or((0, 0));
            physical.push(PhysicalDevice {
                nvml_index: index,
                uuid: device.uuid().unwrap_or_default(),
                compute_capability: capability,
                cores: device.num_cores().unwrap_or(0),
            });
        }

        let order = DeviceOrder::from_env_value(std::env::var(DEVICE_ORDER_ENV).ok().as_deref());
        let visible = std::env::var(VISIBLE_DEVICES_ENV)
            .ok()
            .map(|value| parse_visible_devices(&value));
        let ordinals = visible_ordinals(&order_devices(physical, order), visible.as_deref());
        debug!(
            "{} of {} NVML devices visible as compute ordinals ({:?} order): {:?}",
            ordinals.len(),
            count,
            order,
            ordinals
        );

        let _ = self.ordinals.set(ordinals);
        self.ordinals
            .get()
            .map(Vec::as_slice)
            .ok_or(GpuError::NotInitialized)
    }

    /// NVML index backing a compute ordinal
    fn nvml_index(&self, ordinal: u32) -> Result<u32> {
        self.ordinals()?
            .get(ordinal as usize)
            .copied()
            .ok_or_else(|| GpuError::DeviceNotFound(ordinal.to_string()))
    }
}

impl Default for NvmlBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for NvmlBackend {
    fn initialize(&self) -> Result<()> {
        if self.nvml.get().is_some() {
            return Ok(());
        }

        let nvml = Nvml::init().map_err(|e| GpuError::InitializationFailed(e.to_string()))?;
        if let Ok(version) = nvml.sys_driver_version() {
            info!("Initialized NVML, driver version {}", version);
        }
        let _ = self.nvml.set(nvml);
        Ok(())
    }

    fn device_count(&self) -> Result<u32> {
        Ok(self.ordinals()?.len() as u32)
    }

    fn device_properties(&self, index: u32) -> Result<DeviceProperties> {
        let device = self
            .nvml()?
            .device_by_index(self.nvml_index(index)?)
            .map_err(runtime_error)?;
        let name = device.name().map_err(runtime_error)?;
        let capability = device.cuda_compute_capability().map_err(runtime_error)?;
        Ok(DeviceProperties {
            name,
            compute_capability: (capability.major.max(0) as u32, capability.minor.max(0) as u32),
        })
    }

    fn pci_bus_id(&self, index: u32) -> Result<String> {
        let device = self
            .nvml()?
            .device_by_index(self.nvml_index(index)?)
            .map_err(runtime_error)?;
        Ok(device.pci_info().map_err(runtime_error)?.bus_id)
    }

    fn handle_by_pci_bus_id(&self, bus_id: &str) -> Result<DeviceHandle> {
        let device = self
            .nvml()?
            .device_by_pci_bus_id(bus_id)
            .map_err(nvml_error)?;
        Ok(DeviceHandle(device.index().map_err(nvml_error)?))
    }

    fn name(&self, device: DeviceHandle) -> Result<String> {
        self.device(device)?.name().map_err(nvml_error)
    }

    fn uuid(&self, device: DeviceHandle) -> Result<String> {
        self.device(device)?.uuid().map_err(nvml_error)
    }

    fn power_management_limit(&self, device: DeviceHandle) -> Result<u32> {
        self.device(device)?.power_management_limit().map_err(nvml_error)
    }

    fn power_usage(&self, device: DeviceHandle) -> Result<u32> {
        self.device(device)?.power_usage().map_err(nvml_error)
    }

    fn total_energy_consumption(&self, device: DeviceHandle) -> Result<u64> {
        self.device(device)?.total_energy_consumption().map_err(nvml_error)
    }

    fn utilization_rates(&self, device: DeviceHandle) -> Result<u32> {
        Ok(self.device(device)?.utilization_rates().map_err(nvml_error)?.gpu)
    }

    fn memory_info(&self, device: DeviceHandle) -> Result<MemoryInfo> {
        let memory = self.device(device)?.memory_info().map_err(nvml_error)?;
        Ok(MemoryInfo {
            total: memory.total,
            used: memory.used,
        })
    }

    fn backend_name(&self) -> &'static str {
        "nvml"
    }
}

fn nvml_error(err: NvmlError) -> GpuError {
    GpuError::Nvml(err.to_string())
}

fn runtime_error(err: NvmlError) -> GpuError {
    GpuError::Runtime(err.to_string())
}
