//! Metric catalog: the fixed set of inference and GPU metric families

use prometheus::{CounterVec, GaugeVec, IntCounterVec, Opts, Registry};

/// Label naming the GPU a series belongs to
pub const GPU_UUID_LABEL: &str = "gpu_uuid";

/// Labels of every inference family
pub const MODEL_LABELS: [&str; 3] = ["model", "version", GPU_UUID_LABEL];

/// Request outcome and latency counters, labeled by model identity
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Successful requests, all batch sizes
    pub request_success: IntCounterVec,

    /// Failed requests, all batch sizes
    pub request_failure: IntCounterVec,

    /// Inferences performed (a batch of N counts N)
    pub inference_count: IntCounterVec,

    /// Model executions performed
    pub execution_count: IntCounterVec,

    pub request_duration_us: IntCounterVec,
    pub queue_duration_us: IntCounterVec,
    pub compute_input_duration_us: IntCounterVec,
    pub compute_infer_duration_us: IntCounterVec,
    pub compute_output_duration_us: IntCounterVec,
}

impl InferenceMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let counter = |name: &str, help: &str| IntCounterVec::new(Opts::new(name, help), &MODEL_LABELS);

        Ok(Self {
            request_success: counter(
                "nv_inference_request_success",
                "Number of successful inference requests, all batch sizes",
            )?,
            request_failure: counter(
                "nv_inference_request_failure",
                "Number of failed inference requests, all batch sizes",
            )?,
            inference_count: counter("nv_inference_count", "Number of inferences performed")?,
            execution_count: counter(
                "nv_inference_exec_count",
                "Number of model executions performed",
            )?,
            request_duration_us: counter(
                "nv_inference_request_duration_us",
                "Cummulative inference request duration in microseconds",
            )?,
            queue_duration_us: counter(
                "nv_inference_queue_duration_us",
                "Cummulative inference queuing duration in microseconds",
            )?,
            compute_input_duration_us: counter(
                "nv_inference_compute_input_duration_us",
                "Cummulative compute input duration in microseconds",
            )?,
            compute_infer_duration_us: counter(
                "nv_inference_compute_infer_duration_us",
                "Cummulative compute inference duration in microseconds",
            )?,
            compute_output_duration_us: counter(
                "nv_inference_compute_output_duration_us",
                "Cummulative inference compute output duration in microseconds",
            )?,
        })
    }

    /// Register all metrics with the given registry
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.request_success.clone()))?;
        registry.register(Box::new(self.request_failure.clone()))?;
        registry.register(Box::new(self.inference_count.clone()))?;
        registry.register(Box::new(self.execution_count.clone()))?;
        registry.register(Box::new(self.request_duration_us.clone()))?;
        registry.register(Box::new(self.queue_duration_us.clone()))?;
        registry.register(Box::new(self.compute_input_duration_us.clone()))?;
        registry.register(Box::new(self.compute_infer_duration_us.clone()))?;
        registry.register(Box::new(self.compute_output_duration_us.clone()))?;
        Ok(())
    }
}

impl Default for InferenceMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create InferenceMetrics")
    }
}

/// Per-device GPU families, labeled by device UUID
#[derive(Debug, Clone)]
pub struct GpuMetricFamilies {
    /// Utilization as a fraction in [0.0, 1.0)
    pub utilization: GaugeVec,

    pub memory_total_bytes: GaugeVec,
    pub memory_used_bytes: GaugeVec,

    /// Power draw in watts
    pub power_usage: GaugeVec,

    /// Power management limit in watts
    pub power_limit: GaugeVec,

    /// Joules consumed since the sampler started
    pub energy_consumption: CounterVec,
}

impl GpuMetricFamilies {
    pub fn new() -> prometheus::Result<Self> {
        let gauge = |name: &str, help: &str| GaugeVec::new(Opts::new(name, help), &[GPU_UUID_LABEL]);

        Ok(Self {
            utilization: gauge("nv_gpu_utilization", "GPU utilization rate [0.0 - 1.0)")?,
            memory_total_bytes: gauge("nv_gpu_memory_total_bytes", "GPU total memory, in bytes")?,
            memory_used_bytes: gauge("nv_gpu_memory_used_bytes", "GPU used memory, in bytes")?,
            power_usage: gauge("nv_gpu_power_usage", "GPU power usage in watts")?,
            power_limit: gauge("nv_gpu_power_limit", "GPU power management limit in watts")?,
            energy_consumption: CounterVec::new(
                Opts::new(
                    "nv_energy_consumption",
                    "GPU energy consumption in joules since the Triton Server started",
                ),
                &[GPU_UUID_LABEL],
            )?,
        })
    }

    /// Register all metrics with the given registry
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.utilization.clone()))?;
        registry.register(Box::new(self.memory_total_bytes.clone()))?;
        registry.register(Box::new(self.memory_used_bytes.clone()))?;
        registry.register(Box::new(self.power_usage.clone()))?;
        registry.register(Box::new(self.power_limit.clone()))?;
        registry.register(Box::new(self.energy_consumption.clone()))?;
        Ok(())
    }
}

impl Default for GpuMetricFamilies {
    fn default() -> Self {
        Self::new().expect("Failed to create GpuMetricFamilies")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    #[test]
    fn test_inference_family_names() {
        let metrics = InferenceMetrics::new().unwrap();
        let names: Vec<String> = [
            &metrics.request_success,
            &metrics.request_failure,
            &metrics.inference_count,
            &metrics.execution_count,
            &metrics.request_duration_us,
            &metrics.queue_duration_us,
            &metrics.compute_input_duration_us,
            &metrics.compute_infer_duration_us,
            &metrics.compute_output_duration_us,
        ]
        .iter()
        .map(|c| c.desc()[0].fq_name.clone())
        .collect();

        assert_eq!(
            names,
            vec![
                "nv_inference_request_success",
                "nv_inference_request_failure",
                "nv_inference_count",
                "nv_inference_exec_count",
                "nv_inference_request_duration_us",
                "nv_inference_queue_duration_us",
                "nv_inference_compute_input_duration_us",
                "nv_inference_compute_infer_duration_us",
                "nv_inference_compute_output_duration_us",
            ]
        );
    }

    #[test]
    fn test_gpu_family_names() {
        let families = GpuMetricFamilies::new().unwrap();
        assert_eq!(families.utilization.desc()[0].fq_name, "nv_gpu_utilization");
        assert_eq!(families.memory_total_bytes.desc()[0].fq_name, "nv_gpu_memory_total_bytes");
        assert_eq!(families.memory_used_bytes.desc()[0].fq_name, "nv_gpu_memory_used_bytes");
        assert_eq!(families.power_usage.desc()[0].fq_name, "nv_gpu_power_usage");
        assert_eq!(families.power_limit.desc()[0].fq_name, "nv_gpu_power_limit");
        assert_eq!(families.energy_consumption.desc()[0].fq_name, "nv_energy_consumption");
        assert_eq!(families.utilization.desc()[0].variable_labels, vec![GPU_UUID_LABEL]);
    }

    #[test]
    fn test_register_once() {
        let registry = Registry::new();
        let metrics = InferenceMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        // same family names cannot be registered twice
        assert!(InferenceMetrics::new().unwrap().register(&registry).is_err());

        GpuMetricFamilies::new().unwrap().register(&registry).unwrap();
    }

    #[test]
    fn test_empty_families_not_exported() {
        let registry = Registry::new();
        GpuMetricFamilies::new().unwrap().register(&registry).unwrap();
        // vec families without any labeled child are omitted from gather
        assert!(registry.gather().is_empty());
    }
}
