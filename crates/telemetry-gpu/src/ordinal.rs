//! Compute-runtime ordinals over management-library devices
//!
//! CUDA numbers devices by `CUDA_DEVICE_ORDER` and then restricts and
//! renumbers them through `CUDA_VISIBLE_DEVICES`. NVML enumerates in PCI bus
//! order and ignores both variables.

/// Environment variable selecting the CUDA enumeration order
pub const DEVICE_ORDER_ENV: &str = "CUDA_DEVICE_ORDER";

/// Environment variable restricting the devices CUDA exposes
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// One usable entry of `CUDA_VISIBLE_DEVICES`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VisibleEntry {
    /// Position in the `CUDA_DEVICE_ORDER` enumeration
    Index(u32),
    /// `GPU-` prefixed UUID, possibly abbreviated
    Uuid(String),
}

/// Enumeration order of compute-runtime ordinals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum DeviceOrder {
    #[default]
    FastestFirst,
    PciBusId,
}

impl DeviceOrder {
    /// Order named by a `CUDA_DEVICE_ORDER` value; unknown values mean the default
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("PCI_BUS_ID") => DeviceOrder::PciBusId,
            _ => DeviceOrder::FastestFirst,
        }
    }
}

/// A management-library device as the compute runtime would rank it
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PhysicalDevice {
    pub nvml_index: u32,
    pub uuid: String,
    pub compute_capability: (i32, i32),
    pub cores: u32,
}

/// Parse `CUDA_VISIBLE_DEVICES`.
///
/// An empty value hides every device. Parsing stops at the first entry that is
/// neither an index nor a `GPU-` UUID; later entries are ignored.
pub(crate) fn parse_visible_devices(value: &str) -> Vec<VisibleEntry> {
    let mut entries = Vec::new();
    if value.trim().is_empty() {
        return entries;
    }

    for entry in value.split(',').map(str::trim) {
        if let Ok(index) = entry.parse::<u32>() {
            entries.push(VisibleEntry::Index(index));
        } else if entry.len() > 4 && entry.starts_with("GPU-") {
            entries.push(VisibleEntry::Uuid(entry.to_string()));
        } else {
            break;
        }
    }
    entries
}

/// Rank devices given in PCI bus order.
///
/// Fastest-first sorts by compute capability and then core count, both
/// descending. Ties keep PCI bus order.
pub(crate) fn order_devices(mut devices: Vec<PhysicalDevice>, order: DeviceOrder) -> Vec<PhysicalDevice> {
    if order == DeviceOrder::FastestFirst {
        devices.sort_by(|a, b| {
            (b.compute_capability, b.cores).cmp(&(a.compute_capability, a.cores))
        });
    }
    devices
}

/// NVML index of every compute-runtime ordinal, in ordinal order.
///
/// `visible` is `None` when `CUDA_VISIBLE_DEVICES` is unset. An entry that
/// matches no device, matches an abbreviated UUID ambiguously, or repeats an
/// earlier device ends the list.
pub(crate) fn visible_ordinals(
    ranked: &[PhysicalDevice],
    visible: Option<&[VisibleEntry]>,
) -> Vec<u32> {
    let Some(entries) = visible else {
        return ranked.iter().map(|d| d.nvml_index).collect();
    };

    let mut ordinals = Vec::with_capacity(entries.len());
    for entry in entries {
        let device = match entry {
            VisibleEntry::Index(position) => ranked.get(*position as usize),
            VisibleEntry::Uuid(prefix) => {
                let mut matches = ranked.iter().filter(|d| d.uuid.starts_with(prefix.as_str()));
                match (matches.next(), matches.next()) {
                    (Some(device), None) => Some(device),
                    _ => None,
                }
            }
        };

        match device {
            Some(device) if !ordinals.contains(&device.nvml_index) => {
                ordinals.push(device.nvml_index)
            }
            _ => break,
        }
    }
    ordinals
}
