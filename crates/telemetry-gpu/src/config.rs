//! GPU backend selection

use serde::{Deserialize, Serialize};

/// GPU management backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackendKind {
    /// NVIDIA Management Library
    Nvml,
    /// Mock backend for testing
    Mock,
    /// No hardware backend, GPU telemetry stays unavailable
    None,
}

impl Default for GpuBackendKind {
    fn default() -> Self {
        GpuBackendKind::Nvml
    }
}

impl std::fmt::Display for GpuBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuBackendKind::Nvml => write!(f, "nvml"),
            GpuBackendKind::Mock => write!(f, "mock"),
            GpuBackendKind::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for GpuBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nvml" => Ok(GpuBackendKind::Nvml),
            "mock" => Ok(GpuBackendKind::Mock),
            "none" | "" => Ok(GpuBackendKind::None),
            _ => Err(format!("Unknown GPU backend: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_backend_parsing() {
        assert_eq!("nvml".parse::<GpuBackendKind>().unwrap(), GpuBackendKind::Nvml);
        assert_eq!("NVML".parse::<GpuBackendKind>().unwrap(), GpuBackendKind::Nvml);
        assert_eq!("mock".parse::<GpuBackendKind>().unwrap(), GpuBackendKind::Mock);
        assert_eq!("none".parse::<GpuBackendKind>().unwrap(), GpuBackendKind::None);
        assert!("dcgm".parse::<GpuBackendKind>().is_err());
    }

    #[test]
    fn test_gpu_backend_display() {
        assert_eq!(GpuBackendKind::Nvml.to_string(), "nvml");
        assert_eq!(GpuBackendKind::Mock.to_string(), "mock");
        assert_eq!(GpuBackendKind::None.to_string(), "none");
    }

    #[test]
    fn test_gpu_backend_serde() {
        let json = serde_json::to_string(&GpuBackendKind::Mock).unwrap();
        assert_eq!(json, "\"mock\"");
        let parsed: GpuBackendKind = serde_json::from_str("\"nvml\"").unwrap();
        assert_eq!(parsed, GpuBackendKind::Nvml);
    }
}
