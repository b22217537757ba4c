//! Mock GPU backend for testing

use crate::backend::{DeviceHandle, DeviceProperties, GpuBackend, MemoryInfo};
use crate::{GpuError, Result};

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// Reads the mock can fail or count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockMetric {
    Properties,
    PciBusId,
    Handle,
    Name,
    Uuid,
    PowerLimit,
    PowerUsage,
    Energy,
    Utilization,
    Memory,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Always,
    Times(usize),
}

#[derive(Debug, Clone)]
struct MockDevice {
    uuid: String,
    name: String,
    bus_id: String,
    power_limit_mw: u32,
    power_usage_mw: u32,
    energy_mj: u64,
    energy_samples: VecDeque<u64>,
    utilization: u32,
    memory: MemoryInfo,
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<MockDevice>,
    initialized: bool,
    initialize_calls: usize,
    initialize_error: Option<GpuError>,
    device_count_error: Option<GpuError>,
    failures: HashMap<(u32, MockMetric), Failure>,
    reads: HashMap<(u32, MockMetric), usize>,
}

/// In-process backend with scriptable devices and failures
#[derive(Debug)]
pub struct MockGpuBackend {
    state: Mutex<MockState>,
}

impl MockGpuBackend {
    /// Create a mock backend with `count` healthy devices
    pub fn new(count: u32) -> Self {
        info!("Creating mock GPU backend with {} devices", count);

        let devices = (0..count).map(create_mock_device).collect();
        Self {
            state: Mutex::new(MockState {
                devices,
                ..Default::default()
            }),
        }
    }

    /// Make `initialize` fail
    pub fn fail_initialize(&self, message: &str) {
        self.state.lock().initialize_error =
            Some(GpuError::InitializationFailed(message.to_string()));
    }

    /// Make `device_count` fail
    pub fn fail_device_count(&self, message: &str) {
        self.state.lock().device_count_error = Some(GpuError::Runtime(message.to_string()));
    }

    /// Fail every read of `metric` on `device` until cleared
    pub fn fail_metric(&self, device: u32, metric: MockMetric) {
        self.state.lock().failures.insert((device, metric), Failure::Always);
    }

    /// Fail the next `times` reads of `metric` on `device`
    pub fn fail_metric_times(&self, device: u32, metric: MockMetric, times: usize) {
        self.state.lock().failures.insert((device, metric), Failure::Times(times));
    }

    /// Stop failing `metric` on `device`
    pub fn clear_failure(&self, device: u32, metric: MockMetric) {
        self.state.lock().failures.remove(&(device, metric));
    }

    /// Queue raw energy counter values returned by successive reads
    pub fn set_energy_samples(&self, device: u32, samples: Vec<u64>) {
        if let Some(d) = self.state.lock().devices.get_mut(device as usize) {
            d.energy_samples = samples.into();
        }
    }

    pub fn set_power_usage(&self, device: u32, milliwatts: u32) {
        if let Some(d) = self.state.lock().devices.get_mut(device as usize) {
            d.power_usage_mw = milliwatts;
        }
    }

    pub fn set_power_limit(&self, device: u32, milliwatts: u32) {
        if let Some(d) = self.state.lock().devices.get_mut(device as usize) {
            d.power_limit_mw = milliwatts;
        }
    }

    pub fn set_utilization(&self, device: u32, percent: u32) {
        if let Some(d) = self.state.lock().devices.get_mut(device as usize) {
            d.utilization = percent;
        }
    }

    pub fn set_memory(&self, device: u32, total: u64, used: u64) {
        if let Some(d) = self.state.lock().devices.get_mut(device as usize) {
            d.memory = MemoryInfo { total, used };
        }
    }

    /// Number of attempted reads of `metric` on `device`, failed ones included
    pub fn reads(&self, device: u32, metric: MockMetric) -> usize {
        self.state
            .lock()
            .reads
            .get(&(device, metric))
            .copied()
            .unwrap_or(0)
    }

    /// Number of `initialize` calls
    pub fn initialize_calls(&self) -> usize {
        self.state.lock().initialize_calls
    }

    /// Common bookkeeping for a per-device read: count it, apply scripted failures,
    /// then hand the device to `read`.
    fn read<T>(
        &self,
        index: u32,
        metric: MockMetric,
        needs_init: bool,
        read: impl FnOnce(&mut MockDevice) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock();
        *state.reads.entry((index, metric)).or_insert(0) += 1;

        if needs_init && !state.initialized {
            return Err(GpuError::NotInitialized);
        }

        match state.failures.get_mut(&(index, metric)) {
            Some(Failure::Always) => {
                return Err(GpuError::Nvml(format!("{:?} read failed", metric)));
            }
            Some(Failure::Times(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                return Err(GpuError::Nvml(format!("{:?} read failed", metric)));
            }
            _ => {}
        }

        let device = state
            .devices
            .get_mut(index as usize)
            .ok_or_else(|| GpuError::DeviceNotFound(index.to_string()))?;
        Ok(read(device))
    }
}

impl GpuBackend for MockGpuBackend {
    fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.initialize_calls += 1;
        if let Some(err) = state.initialize_error.clone() {
            return Err(err);
        }
        state.initialized = true;
        debug!("Initialized mock GPU backend");
        Ok(())
    }

    fn device_count(&self) -> Result<u32> {
        let state = self.state.lock();
        if let Some(err) = state.device_count_error.clone() {
            return Err(err);
        }
        Ok(state.devices.len() as u32)
    }

    fn device_properties(&self, index: u32) -> Result<DeviceProperties> {
        self.read(index, MockMetric::Properties, false, |d| DeviceProperties {
            name: d.name.clone(),
            compute_capability: (8, 6),
        })
    }

    fn pci_bus_id(&self, index: u32) -> Result<String> {
        self.read(index, MockMetric::PciBusId, false, |d| d.bus_id.clone())
    }

    fn handle_by_pci_bus_id(&self, bus_id: &str) -> Result<DeviceHandle> {
        let position = self
            .state
            .lock()
            .devices
            .iter()
            .position(|d| d.bus_id.eq_ignore_ascii_case(bus_id));
        let index = position.ok_or_else(|| GpuError::DeviceNotFound(bus_id.to_string()))? as u32;
        self.read(index, MockMetric::Handle, true, |_| DeviceHandle(index))
    }

    fn name(&self, device: DeviceHandle) -> Result<String> {
        self.read(device.0, MockMetric::Name, true, |d| d.name.clone())
    }

    fn uuid(&self, device: DeviceHandle) -> Result<String> {
        self.read(device.0, MockMetric::Uuid, true, |d| d.uuid.clone())
    }

    fn power_management_limit(&self, device: DeviceHandle) -> Result<u32> {
        self.read(device.0, MockMetric::PowerLimit, true, |d| d.power_limit_mw)
    }

    fn power_usage(&self, device: DeviceHandle) -> Result<u32> {
        self.read(device.0, MockMetric::PowerUsage, true, |d| d.power_usage_mw)
    }

    fn total_energy_consumption(&self, device: DeviceHandle) -> Result<u64> {
        self.read(device.0, MockMetric::Energy, true, |d| {
            if let Some(next) = d.energy_samples.pop_front() {
                d.energy_mj = next;
            }
            d.energy_mj
        })
    }

    fn utilization_rates(&self, device: DeviceHandle) -> Result<u32> {
        self.read(device.0, MockMetric::Utilization, true, |d| d.utilization)
    }

    fn memory_info(&self, device: DeviceHandle) -> Result<MemoryInfo> {
        self.read(device.0, MockMetric::Memory, true, |d| d.memory)
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}

/// Create a mock device
fn create_mock_device(index: u32) -> MockDevice {
    MockDevice {
        uuid: mock_uuid(index),
        name: format!("Mock GPU {}", index),
        bus_id: format!("00000000:{:02X}:00.0", index + 1),
        power_limit_mw: 300_000,
        power_usage_mw: 150_000 + index * 25_000,
        energy_mj: 1_000_000,
        energy_samples: VecDeque::new(),
        utilization: 45 + index * 10,
        memory: MemoryInfo {
            total: 8 * 1024 * 1024 * 1024,
            used: 2 * 1024 * 1024 * 1024,
        },
    }
}

/// UUID reported for mock device `index`
pub fn mock_uuid(index: u32) -> String {
    format!("GPU-00000000-0000-0000-0000-{:012x}", index)
}
