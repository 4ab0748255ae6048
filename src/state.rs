use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::alarm::HysteresisAlarm;

/// Last observed sample of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampledMetric {
    pub value: Option<f64>,
    /// Auxiliary reading such as total capacity in bytes.
    pub secondary: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One sample as returned by a sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub value: Option<f64>,
    pub secondary: Option<f64>,
}

impl Sample {
    pub fn new(value: f64) -> Self {
        Self {
            value: Some(value),
            secondary: None,
        }
    }

    pub fn with_secondary(value: f64, secondary: f64) -> Self {
        Self {
            value: Some(value),
            secondary: Some(secondary),
        }
    }

    pub fn absent() -> Self {
        Self::default()
    }
}

/// Point-in-time copy of a monitor's published state.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub monitor: String,
    pub value: Option<f64>,
    pub secondary: Option<f64>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub updated_at: Option<DateTime<Utc>>,
    pub threshold: Option<f64>,
    pub consecutive_violations: u32,
    pub alarmed: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    metric: SampledMetric,
    alarm: HysteresisAlarm,
    threshold: Option<f64>,
}

impl MonitorState {
    fn record(&mut self, sample: Sample, threshold: f64, now: DateTime<Utc>) -> Published {
        let edge = self.alarm.update(sample.value, threshold);
        self.metric = SampledMetric {
            value: sample.value,
            secondary: sample.secondary,
            updated_at: Some(now),
        };
        self.threshold = Some(threshold);
        Published {
            edge,
            consecutive_violations: self.alarm.consecutive_violations(),
            alarmed: self.alarm.alarmed(),
        }
    }
}

/// Published state of one resource monitor.
///
/// Sample, timestamp, threshold and alarm are written under a single write lock, so a
/// reader never pairs a value from one cycle with the alarm flag of another.
#[derive(Clone)]
pub struct SharedMonitorState {
    name: Arc<str>,
    inner: Arc<RwLock<MonitorState>>,
}

/// Outcome of publishing one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Published {
    /// The alarm rose on this sample.
    pub edge: bool,
    pub consecutive_violations: u32,
    pub alarmed: bool,
}

impl SharedMonitorState {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::new(RwLock::new(MonitorState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the sample through the alarm and publish everything in one step.
    ///
    /// `abort` is evaluated while the write lock is held; returning `true` discards the
    /// sample without touching the published state.
    pub async fn publish_unless<F>(
        &self,
        sample: Sample,
        threshold: f64,
        now: DateTime<Utc>,
        abort: F,
    ) -> Option<Published>
    where
        F: FnOnce() -> bool,
    {
        let mut guard = self.inner.write().await;
        if abort() {
            return None;
        }
        Some(guard.record(sample, threshold, now))
    }

    pub async fn publish(&self, sample: Sample, threshold: f64, now: DateTime<Utc>) -> Published {
        self.inner.write().await.record(sample, threshold, now)
    }

    pub async fn snapshot(&self) -> MonitorSnapshot {
        let guard = self.inner.read().await;
        MonitorSnapshot {
            monitor: self.name.to_string(),
            value: guard.metric.value,
            secondary: guard.metric.secondary,
            updated_at: guard.metric.updated_at,
            threshold: guard.threshold,
            consecutive_violations: guard.alarm.consecutive_violations(),
            alarmed: guard.alarm.alarmed(),
        }
    }

    pub async fn metric(&self) -> SampledMetric {
        self.inner.read().await.metric
    }

    pub async fn current_value(&self) -> Option<f64> {
        self.inner.read().await.metric.value
    }

    pub async fn secondary_value(&self) -> Option<f64> {
        self.inner.read().await.metric.secondary
    }

    pub async fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.metric.updated_at
    }

    pub async fn alarmed(&self) -> bool {
        self.inner.read().await.alarm.alarmed()
    }

    pub async fn consecutive_violations(&self) -> u32 {
        self.inner.read().await.alarm.consecutive_violations()
    }
}
