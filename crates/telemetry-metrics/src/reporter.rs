//! Per-model reporting handle used on the request path

use crate::catalog::InferenceMetrics;
use crate::registry::Metrics;

use prometheus::IntCounter;
use tracing::debug;

/// Inference counters bound to one (model, version, GPU) label set
#[derive(Debug, Clone)]
pub struct ModelReporter {
    gpu_uuid: String,
    request_success: IntCounter,
    request_failure: IntCounter,
    inference_count: IntCounter,
    execution_count: IntCounter,
    request_duration_us: IntCounter,
    queue_duration_us: IntCounter,
    compute_input_duration_us: IntCounter,
    compute_infer_duration_us: IntCounter,
    compute_output_duration_us: IntCounter,
}

impl ModelReporter {
    /// Reporter for a model, or `None` when metrics are not enabled
    pub fn create(
        metrics: &Metrics,
        model: &str,
        version: &str,
        device: Option<i32>,
    ) -> Option<Self> {
        if !metrics.enabled() {
            return None;
        }
        Some(Self::new(metrics, model, version, device))
    }

    /// Bind the label set, resolving the GPU identity of `device` if any
    pub fn new(metrics: &Metrics, model: &str, version: &str, device: Option<i32>) -> Self {
        let gpu_uuid = device
            .and_then(|d| metrics.uuid_for_cuda_device(d))
            .unwrap_or_default();
        debug!(
            "Reporting metrics for model {} version {} on GPU '{}'",
            model, version, gpu_uuid
        );

        let labels = [model, version, gpu_uuid.as_str()];
        let InferenceMetrics {
            request_success,
            request_failure,
            inference_count,
            execution_count,
            request_duration_us,
            queue_duration_us,
            compute_input_duration_us,
            compute_infer_duration_us,
            compute_output_duration_us,
        } = metrics.inference();

        Self {
            request_success: request_success.with_label_values(&labels),
            request_failure: request_failure.with_label_values(&labels),
            inference_count: inference_count.with_label_values(&labels),
            execution_count: execution_count.with_label_values(&labels),
            request_duration_us: request_duration_us.with_label_values(&labels),
            queue_duration_us: queue_duration_us.with_label_values(&labels),
            compute_input_duration_us: compute_input_duration_us.with_label_values(&labels),
            compute_infer_duration_us: compute_infer_duration_us.with_label_values(&labels),
            compute_output_duration_us: compute_output_duration_us.with_label_values(&labels),
            gpu_uuid,
        }
    }

    /// GPU identity this reporter labels with, empty for non-GPU execution
    pub fn gpu_uuid(&self) -> &str {
        &self.gpu_uuid
    }

    pub fn record_success(&self) {
        self.request_success.inc();
    }

    pub fn record_failure(&self) {
        self.request_failure.inc();
    }

    /// One model execution over `batch_size` inferences
    pub fn record_execution(&self, batch_size: u64) {
        self.inference_count.inc_by(batch_size);
        self.execution_count.inc();
    }

    pub fn add_request_duration_us(&self, us: u64) {
        self.request_duration_us.inc_by(us);
    }

    pub fn add_queue_duration_us(&self, us: u64) {
        self.queue_duration_us.inc_by(us);
    }

    pub fn add_compute_input_duration_us(&self, us: u64) {
        self.compute_input_duration_us.inc_by(us);
    }

    pub fn add_compute_infer_duration_us(&self, us: u64) {
        self.compute_infer_duration_us.inc_by(us);
    }

    pub fn add_compute_output_duration_us(&self, us: u64) {
        self.compute_output_duration_us.inc_by(us);
    }
}
