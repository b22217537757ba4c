//! Prometheus text exposition of a registry

use crate::{MetricsError, Result};
use prometheus::{Encoder, Registry, TextEncoder};

/// Renders every family of a registry in the Prometheus text format
#[derive(Debug, Default)]
pub struct PrometheusExporter {
    encoder: TextEncoder,
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self {
            encoder: TextEncoder::new(),
        }
    }

    /// Export metrics as Prometheus text format
    pub fn export(&self, registry: &Registry) -> Result<String> {
        let metric_families = registry.gather();

        let mut buffer = Vec::new();
        self.encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Export(format!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer)
            .map_err(|e| MetricsError::Export(format!("Failed to convert metrics to string: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{GpuMetricFamilies, InferenceMetrics};

    #[test]
    fn test_export_empty_registry() {
        let exporter = PrometheusExporter::new();
        let output = exporter.export(&Registry::new()).unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_export_labeled_series() {
        let registry = Registry::new();
        let inference = InferenceMetrics::new().unwrap();
        inference.register(&registry).unwrap();
        inference
            .inference_count
            .with_label_values(&["resnet50", "1", "GPU-abc"])
            .inc_by(4);

        let gpu = GpuMetricFamilies::new().unwrap();
        gpu.register(&registry).unwrap();
        gpu.power_usage.with_label_values(&["GPU-abc"]).set(125.5);

        let output = PrometheusExporter::new().export(&registry).unwrap();
        assert!(output.contains("# HELP nv_inference_count Number of inferences performed"));
        assert!(output.contains("# TYPE nv_inference_count counter"));
        assert!(output.contains(
            r#"nv_inference_count{gpu_uuid="GPU-abc",model="resnet50",version="1"} 4"#
        ));
        assert!(output.contains("# TYPE nv_gpu_power_usage gauge"));
        assert!(output.contains(r#"nv_gpu_power_usage{gpu_uuid="GPU-abc"} 125.5"#));
        // families without series are omitted
        assert!(!output.contains("nv_inference_request_failure"));
    }
}
