//! GPU sampler: the background polling loop and its per-metric circuit breakers
//!
//! A single thread wakes every poll interval and reads each tracked device's
//! metrics from the hardware backend. Every (device, metric) pair has its own
//! breaker: after `failure_threshold` consecutive failed reads the pair is
//! never polled again for the life of the process. Other metrics on the same
//! device and every other device keep being sampled.
//!
//! Shutdown is cooperative. The exit flag is checked at each sleep boundary
//! and the owner joins the thread, so no series is written after
//! [`SamplerHandle::stop`] returns.

use crate::discovery::TrackedDevice;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use telemetry_gpu::GpuBackend;
use tracing::{debug, info, warn};

const METRIC_KINDS: usize = 5;

/// Metric kinds polled per device, in polling order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    PowerLimit,
    PowerUsage,
    Energy,
    Utilization,
    Memory,
}

impl MetricKind {
    pub const ALL: [MetricKind; METRIC_KINDS] = [
        MetricKind::PowerLimit,
        MetricKind::PowerUsage,
        MetricKind::Energy,
        MetricKind::Utilization,
        MetricKind::Memory,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::PowerLimit => write!(f, "power limit"),
            MetricKind::PowerUsage => write!(f, "power usage"),
            MetricKind::Energy => write!(f, "energy consumption"),
            MetricKind::Utilization => write!(f, "utilization"),
            MetricKind::Memory => write!(f, "memory"),
        }
    }
}

/// Milliwatts to watts
const MILLI: f64 = 0.001;

/// Percent to fraction
const PERCENT: f64 = 0.01;

/// Consecutive-failure breaker for one (device, metric) pair.
///
/// `Tripped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreaker {
    Active { consecutive_failures: u32 },
    Tripped,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        CircuitBreaker::Active {
            consecutive_failures: 0,
        }
    }

    pub fn is_tripped(&self) -> bool {
        matches!(self, CircuitBreaker::Tripped)
    }

    pub fn record_success(&mut self) {
        if !self.is_tripped() {
            *self = CircuitBreaker::new();
        }
    }

    /// Record a failed read; returns true when this failure trips the breaker
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        match *self {
            CircuitBreaker::Active {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= threshold {
                    *self = CircuitBreaker::Tripped;
                    true
                } else {
                    *self = CircuitBreaker::Active {
                        consecutive_failures: failures,
                    };
                    false
                }
            }
            CircuitBreaker::Tripped => false,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Sampling state owned by the sampler for one device
struct DeviceState {
    device: TrackedDevice,
    breakers: [CircuitBreaker; METRIC_KINDS],
    /// Raw energy counter (mJ) seen on the previous successful read
    last_energy: Option<u64>,
}

/// One sampler: the devices it polls and their breaker and energy state
pub struct Sampler {
    backend: Arc<dyn GpuBackend>,
    devices: Vec<DeviceState>,
    failure_threshold: u32,
}

impl Sampler {
    pub(crate) fn new(
        backend: Arc<dyn GpuBackend>,
        devices: Vec<TrackedDevice>,
        failure_threshold: u32,
    ) -> Self {
        let devices = devices
            .into_iter()
            .map(|device| DeviceState {
                device,
                breakers: [CircuitBreaker::new(); METRIC_KINDS],
                last_energy: None,
            })
            .collect();

        Self {
            backend,
            devices,
            failure_threshold,
        }
    }

    /// Breaker state of `kind` on the device at position `device`
    pub fn breaker(&self, device: usize, kind: MetricKind) -> Option<CircuitBreaker> {
        self.devices.get(device).map(|d| d.breakers[kind.slot()])
    }

    /// Run one sampling round over every tracked device
    pub fn sample_once(&mut self) {
        let backend = Arc::clone(&self.backend);
        let threshold = self.failure_threshold;

        for state in &mut self.devices {
            for kind in MetricKind::ALL {
                if state.breakers[kind.slot()].is_tripped() {
                    continue;
                }

                match sample_metric(backend.as_ref(), state, kind) {
                    Ok(()) => state.breakers[kind.slot()].record_success(),
                    Err(err) => {
                        let index = state.device.info.index;
                        warn!("failed to get {} for GPU {}: {}", kind, index, err);
                        write_neutral(&state.device, kind);
                        if state.breakers[kind.slot()].record_failure(threshold) {
                            warn!(
                                "{} for GPU {} failed {} consecutive times, no longer collecting it",
                                kind, index, threshold
                            );
                        }
                    }
                }
            }
        }
    }

    /// Start the polling thread
    pub fn spawn(self, interval: Duration) -> std::io::Result<SamplerHandle> {
        let exit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exit);

        info!(
            "Starting GPU sampler for {} devices every {:?}",
            self.devices.len(),
            interval
        );

        let thread = std::thread::Builder::new()
            .name("gpu-metrics".to_string())
            .spawn(move || run_loop(self, interval, &flag))?;

        Ok(SamplerHandle {
            exit,
            thread: Some(thread),
        })
    }
}

fn run_loop(mut sampler: Sampler, interval: Duration, exit: &AtomicBool) {
    let mut rounds: u64 = 0;
    while !exit.load(Ordering::Acquire) {
        std::thread::sleep(interval);
        if exit.load(Ordering::Acquire) {
            break;
        }
        sampler.sample_once();
        rounds += 1;
    }
    debug!("GPU sampler exiting after {} rounds", rounds);
}

/// Read one metric and write its transformed value
fn sample_metric(
    backend: &dyn GpuBackend,
    state: &mut DeviceState,
    kind: MetricKind,
) -> telemetry_gpu::Result<()> {
    let handle = state.device.info.handle;
    let series = &state.device.series;

    match kind {
        MetricKind::PowerLimit => {
            let milliwatts = backend.power_management_limit(handle)?;
            series.power_limit.set(f64::from(milliwatts) * MILLI);
        }
        MetricKind::PowerUsage => {
            let milliwatts = backend.power_usage(handle)?;
            series.power_usage.set(f64::from(milliwatts) * MILLI);
        }
        MetricKind::Energy => {
            let millijoules = backend.total_energy_consumption(handle)?;
            // the first reading only seeds the baseline
            if let Some(last) = state.last_energy {
                let delta = millijoules.saturating_sub(last);
                series.energy_consumption.inc_by(delta as f64 * MILLI);
            }
            state.last_energy = Some(millijoules);
        }
        MetricKind::Utilization => {
            let percent = backend.utilization_rates(handle)?;
            series.utilization.set(f64::from(percent) * PERCENT);
        }
        MetricKind::Memory => {
            let memory = backend.memory_info(handle)?;
            series.memory_total_bytes.set(memory.total as f64);
            series.memory_used_bytes.set(memory.used as f64);
        }
    }

    Ok(())
}

/// Value reported for a round whose read failed
fn write_neutral(device: &TrackedDevice, kind: MetricKind) {
    let series = &device.series;
    match kind {
        MetricKind::PowerLimit => series.power_limit.set(0.0),
        MetricKind::PowerUsage => series.power_usage.set(0.0),
        MetricKind::Utilization => series.utilization.set(0.0),
        MetricKind::Memory => {
            series.memory_total_bytes.set(0.0);
            series.memory_used_bytes.set(0.0);
        }
        // counters only move forward
        MetricKind::Energy => {}
    }
}

/// Owner's handle on the running sampler thread
#[derive(Debug)]
pub struct SamplerHandle {
    exit: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Whether the sampler thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Signal the sampler to exit and wait for it
    pub fn stop(&mut self) {
        self.exit.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("GPU sampler thread panicked");
            }
            info!("GPU sampler stopped");
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
