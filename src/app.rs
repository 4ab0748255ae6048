use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{AppConfig, ThresholdFile};
use crate::metrics::AppMetrics;
use crate::monitor::{
    CpuSampler, DiskSampler, LogCompressor, LogSizeSampler, MemorySampler, PeriodicMonitor,
    ResourceKind, ThresholdProvider,
};
use crate::postmaster::{PgIsReady, PhonyDetector, PhonyHandle, PidFileLocator, SysinfoInspector};
use crate::state::SharedMonitorState;

/// Shared application context passed to HTTP handlers.
#[derive(Clone)]
pub struct AppContext {
    pub metrics: AppMetrics,
    pub monitors: Arc<Vec<SharedMonitorState>>,
    pub phony: Option<PhonyHandle>,
}

impl AppContext {
    pub fn monitor(&self, name: &str) -> Option<&SharedMonitorState> {
        self.monitors.iter().find(|state| state.name() == name)
    }
}

/// Owns every background task of the agent.
pub struct Agent {
    monitors: Vec<PeriodicMonitor>,
    detector: Option<PhonyDetector>,
}

impl Agent {
    pub fn new(monitors: Vec<PeriodicMonitor>, detector: Option<PhonyDetector>) -> Self {
        Self { monitors, detector }
    }

    /// Wire the host resource monitors, the log monitor and (when enabled) the phony
    /// detector against the managed instance.
    pub fn from_config(config: &AppConfig, metrics: &AppMetrics) -> Result<Self> {
        let thresholds: Arc<dyn ThresholdProvider> = match &config.source {
            Some(path) => Arc::new(ThresholdFile::new(path)),
            None => Arc::new(config.thresholds),
        };
        let intervals = &config.sample_intervals;
        let postgres = &config.postgres;

        let monitors = vec![
            PeriodicMonitor::new(
                ResourceKind::Cpu,
                intervals.for_kind(ResourceKind::Cpu),
                CpuSampler::new(),
                thresholds.clone(),
            ),
            PeriodicMonitor::new(
                ResourceKind::Memory,
                intervals.for_kind(ResourceKind::Memory),
                MemorySampler::new(),
                thresholds.clone(),
            ),
            PeriodicMonitor::new(
                ResourceKind::Disk,
                intervals.for_kind(ResourceKind::Disk),
                DiskSampler::new(&postgres.disk_path),
                thresholds.clone(),
            ),
            PeriodicMonitor::new(
                ResourceKind::LogSize,
                intervals.for_kind(ResourceKind::LogSize),
                LogSizeSampler::new(&postgres.data_dir),
                thresholds,
            )
            .with_remediation(LogCompressor::new(&postgres.data_dir)),
        ]
        .into_iter()
        .map(|monitor| monitor.with_metrics(metrics.clone()))
        .collect();

        let detector = if config.phony.enabled {
            let probe =
                PgIsReady::from_dsn(&postgres.dsn).context("invalid Postgres DSN supplied")?;
            let detector = PhonyDetector::new(
                config.phony.clone(),
                PidFileLocator::new(&postgres.data_dir),
                SysinfoInspector::new(),
                probe,
            )
            .with_metrics(metrics.clone());
            Some(detector)
        } else {
            info!("postmaster phony detection disabled");
            None
        };

        Ok(Self::new(monitors, detector))
    }

    pub fn start(&mut self) {
        for monitor in &mut self.monitors {
            monitor.start();
        }
        if let Some(detector) = self.detector.as_mut() {
            detector.start();
        }
    }

    /// Stop every task and wait for all of them to exit.
    pub async fn shutdown(&mut self) {
        for monitor in &self.monitors {
            monitor.stop();
        }
        if let Some(detector) = &self.detector {
            detector.stop();
        }

        for monitor in &mut self.monitors {
            monitor.join().await;
        }
        if let Some(detector) = self.detector.as_mut() {
            detector.join().await;
        }
        info!("all monitors stopped");
    }

    pub fn context(&self, metrics: AppMetrics) -> AppContext {
        AppContext {
            metrics,
            monitors: Arc::new(self.monitors.iter().map(PeriodicMonitor::state).collect()),
            phony: self.detector.as_ref().map(PhonyDetector::handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_without_detector() -> AppConfig {
        let mut config = AppConfig::default();
        config.phony.enabled = false;
        config
    }

    #[test]
    fn context_exposes_every_resource_monitor() {
        let config = config_without_detector();
        let metrics = AppMetrics::new().expect("metrics");
        let agent = Agent::from_config(&config, &metrics).expect("agent");

        let ctx = agent.context(metrics);
        let names: Vec<&str> = ctx.monitors.iter().map(|state| state.name()).collect();
        assert_eq!(names, ["cpu", "memory", "disk", "log_size"]);
        assert!(ctx.monitor("log_size").is_some());
        assert!(ctx.monitor("swap").is_none());
        assert!(ctx.phony.is_none());
    }

    #[test]
    fn invalid_dsn_is_rejected() {
        let mut config = AppConfig::default();
        config.postgres.dsn = "not a connection string".into();
        let metrics = AppMetrics::new().expect("metrics");
        assert!(Agent::from_config(&config, &metrics).is_err());
    }

    #[test]
    fn detector_handle_is_shared_with_context() {
        let mut config = AppConfig::default();
        config.postgres.dsn = "postgres://pgwarden@localhost:5432/postgres".into();
        let metrics = AppMetrics::new().expect("metrics");
        let agent = Agent::from_config(&config, &metrics).expect("agent");
        assert!(agent.context(metrics).phony.is_some());
    }
}
