use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alarm::ALARM_EDGE_COUNT;
use crate::metrics::AppMetrics;
use crate::state::{MonitorSnapshot, Sample, SharedMonitorState};

mod log_size;
mod resources;
mod signal;

pub use log_size::{CompressError, CompressionReport, LogCompressor, LogFile, LogSizeSampler};
pub use resources::{CpuSampler, DiskSampler, MemorySampler};
pub use signal::StopSignal;

/// Resource watched by a [`PeriodicMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    LogSize,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Disk,
        ResourceKind::LogSize,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::LogSize => "log_size",
        }
    }

    /// Limit applied when the threshold provider cannot answer.
    pub const fn default_threshold(self) -> f64 {
        match self {
            ResourceKind::Cpu | ResourceKind::Memory | ResourceKind::Disk => 90.0,
            ResourceKind::LogSize => (100u64 * 1024 * 1024 * 1024) as f64,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SampleError {
    /// The acquisition capability is missing for the lifetime of the process.
    #[error("sampling capability unavailable: {0}")]
    Unavailable(String),
    #[error("sampling failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("failed to read thresholds from {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse thresholds from {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("threshold for {0} is not available")]
    Unavailable(ResourceKind),
}

/// Acquires one sample per monitor cycle.
pub trait Sampler: Send + 'static {
    fn sample(&mut self) -> Result<Sample, SampleError>;
}

impl<F> Sampler for F
where
    F: FnMut() -> Result<Sample, SampleError> + Send + 'static,
{
    fn sample(&mut self) -> Result<Sample, SampleError> {
        self()
    }
}

/// Supplies the currently configured limit for a resource.
pub trait ThresholdProvider: Send + Sync {
    fn threshold(&self, kind: ResourceKind) -> Result<f64, ThresholdError>;
}

/// Corrective action run once each time a monitor's alarm rises.
///
/// Runs on the blocking pool, outside the state lock.
pub trait Remediation: Send + Sync + 'static {
    fn remediate(&self) -> RemediationReport;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemediationReport {
    pub completed: usize,
    pub failed: usize,
}

/// Background sample → threshold → hysteresis → publish loop for one resource.
pub struct PeriodicMonitor {
    kind: ResourceKind,
    state: SharedMonitorState,
    stop: StopSignal,
    worker: Option<Worker>,
    task: Option<JoinHandle<()>>,
}

impl PeriodicMonitor {
    pub fn new<S>(
        kind: ResourceKind,
        interval: Duration,
        sampler: S,
        thresholds: Arc<dyn ThresholdProvider>,
    ) -> Self
    where
        S: Sampler,
    {
        let state = SharedMonitorState::new(kind.as_str());
        let stop = StopSignal::new();
        let worker = Worker {
            kind,
            interval,
            sampler: Box::new(sampler),
            thresholds,
            remediation: None,
            metrics: None,
            state: state.clone(),
            stop: stop.clone(),
        };
        Self {
            kind,
            state,
            stop,
            worker: Some(worker),
            task: None,
        }
    }

    pub fn with_remediation<R>(mut self, remediation: R) -> Self
    where
        R: Remediation,
    {
        if let Some(worker) = self.worker.as_mut() {
            worker.remediation = Some(Arc::new(remediation));
        }
        self
    }

    pub fn with_metrics(mut self, metrics: AppMetrics) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.metrics = Some(metrics);
        }
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Spawn the monitor loop. Returns `false` if it was already started.
    pub fn start(&mut self) -> bool {
        match self.worker.take() {
            Some(worker) => {
                self.task = Some(tokio::spawn(worker.run()));
                true
            }
            None => {
                warn!(monitor = self.kind.as_str(), "monitor already started");
                false
            }
        }
    }

    /// Request the loop to exit. Idempotent and valid before [`start`](Self::start).
    pub fn stop(&self) {
        self.stop.request();
    }

    /// Wait for the loop to exit after [`stop`](Self::stop) or capability loss.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(monitor = self.kind.as_str(), error = ?err, "monitor task aborted");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cloneable reader over the published state.
    pub fn state(&self) -> SharedMonitorState {
        self.state.clone()
    }

    pub async fn current_value(&self) -> Option<f64> {
        self.state.current_value().await
    }

    pub async fn secondary_value(&self) -> Option<f64> {
        self.state.secondary_value().await
    }

    pub async fn alarmed(&self) -> bool {
        self.state.alarmed().await
    }

    pub async fn snapshot(&self) -> MonitorSnapshot {
        self.state.snapshot().await
    }

    pub async fn last_updated(&self) -> Option<chrono::DateTime<Utc>> {
        self.state.last_updated().await
    }
}

enum CycleOutcome {
    Published,
    Stopped,
}

struct Worker {
    kind: ResourceKind,
    interval: Duration,
    sampler: Box<dyn Sampler>,
    thresholds: Arc<dyn ThresholdProvider>,
    remediation: Option<Arc<dyn Remediation>>,
    metrics: Option<AppMetrics>,
    state: SharedMonitorState,
    stop: StopSignal,
}

impl Worker {
    async fn run(mut self) {
        let monitor = self.kind.as_str();
        info!(monitor, interval = ?self.interval, "starting resource monitor");

        loop {
            if self.stop.sleep(self.interval).await {
                break;
            }

            let start = Instant::now();
            match self.run_cycle().await {
                Ok(CycleOutcome::Published) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_duration(monitor, start.elapsed());
                    }
                }
                Ok(CycleOutcome::Stopped) => break,
                Err(SampleError::Unavailable(reason)) => {
                    warn!(monitor, reason = %reason, "sampling unavailable; monitor disabled");
                    break;
                }
                Err(err) => {
                    error!(monitor, error = %err, "monitor cycle failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_error(monitor);
                    }
                }
            }
        }

        info!(monitor, "stopping resource monitor");
    }

    async fn run_cycle(&mut self) -> Result<CycleOutcome, SampleError> {
        let monitor = self.kind.as_str();
        let sample = self.sampler.sample()?;
        let threshold = self.current_threshold();

        let stop = self.stop.clone();
        let Some(published) = self
            .state
            .publish_unless(sample, threshold, Utc::now(), || stop.is_requested())
            .await
        else {
            return Ok(CycleOutcome::Stopped);
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_resource_metrics(monitor, &sample, threshold, &published);
        }
        debug!(
            monitor,
            value = ?sample.value,
            threshold,
            consecutive = published.consecutive_violations,
            "sample published"
        );

        if published.edge {
            warn!(
                monitor,
                value = ?sample.value,
                threshold,
                "{monitor} at or above limit for {ALARM_EDGE_COUNT} consecutive samples"
            );
            self.remediate().await;
        }

        Ok(CycleOutcome::Published)
    }

    fn current_threshold(&self) -> f64 {
        match self.thresholds.threshold(self.kind) {
            Ok(threshold) => threshold,
            Err(err) => {
                let fallback = self.kind.default_threshold();
                warn!(
                    monitor = self.kind.as_str(),
                    error = %err,
                    fallback,
                    "threshold lookup failed; using default"
                );
                fallback
            }
        }
    }

    async fn remediate(&mut self) {
        let Some(remediation) = self.remediation.clone() else {
            return;
        };
        let monitor = self.kind.as_str();

        match tokio::task::spawn_blocking(move || remediation.remediate()).await {
            Ok(report) => {
                info!(
                    monitor,
                    completed = report.completed,
                    failed = report.failed,
                    "remediation finished"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_remediation(monitor, &report);
                }
            }
            Err(err) => {
                error!(monitor, error = ?err, "remediation task failed");
            }
        }
    }
}
