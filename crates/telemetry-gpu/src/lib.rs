//! # telemetry-gpu
//!
//! Hardware-management backends used by the GPU telemetry sampler.
//!
//! This crate provides:
//! - A blocking [`GpuBackend`] trait covering every vendor call the sampler makes
//! - Device resolution by compute ordinal and PCI bus id
//! - Power, energy, utilization and memory reads per device handle
//! - A scriptable mock backend for tests
//!
//! ## Supported Backends
//!
//! - **NVML**: NVIDIA Management Library (`nvml` feature)
//! - **Mock**: deterministic in-process devices (`mock` feature)
//!
//! ## Example
//!
//! ```rust,no_run
//! use telemetry_gpu::{create_gpu_backend, GpuBackendKind};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = create_gpu_backend(&GpuBackendKind::Nvml)?;
//!     backend.initialize()?;
//!
//!     for index in 0..backend.device_count()? {
//!         let bus_id = backend.pci_bus_id(index)?;
//!         let handle = backend.handle_by_pci_bus_id(&bus_id)?;
//!         println!("GPU {}: {}", index, backend.uuid(handle)?);
//!     }
//!
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod backend;
pub mod config;

// Backend-specific modules
#[cfg(feature = "nvml")]
pub mod nvml;

#[cfg(any(feature = "nvml", test))]
mod ordinal;

// Mock implementation for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export main types
pub use backend::{create_gpu_backend, DeviceHandle, DeviceProperties, GpuBackend, MemoryInfo};
pub use config::GpuBackendKind;

#[cfg(any(feature = "mock", test))]
pub use mock::{MockGpuBackend, MockMetric};

/// Result type for GPU operations
pub type Result<T> = std::result::Result<T, GpuError>;

/// Errors that can occur during GPU operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("GPU backend not supported: {0}")]
    UnsupportedBackend(String),

    #[error("GPU initialization failed: {0}")]
    InitializationFailed(String),

    #[error("GPU backend not initialized")]
    NotInitialized,

    #[error("GPU not found: {0}")]
    DeviceNotFound(String),

    #[error("NVML error: {0}")]
    Nvml(String),

    #[error("Compute runtime error: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = GpuError::UnsupportedBackend("rocm".to_string());
        assert_eq!(error.to_string(), "GPU backend not supported: rocm");

        let error = GpuError::DeviceNotFound("0000:3b:00.0".to_string());
        assert_eq!(error.to_string(), "GPU not found: 0000:3b:00.0");

        assert_eq!(GpuError::NotInitialized.to_string(), "GPU backend not initialized");
    }
}
