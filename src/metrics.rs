use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::monitor::RemediationReport;
use crate::postmaster::PhonySnapshot;
use crate::state::{Published, Sample};

/// Metrics registry for the agent scraped by Prometheus.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    loops: LoopMetrics,
    resources: ResourceMetrics,
    remediation: RemediationMetrics,
    postmaster: PostmasterMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("pgwarden".into()), None)?);

        let loops = LoopMetrics::register(&registry)?;
        let resources = ResourceMetrics::register(&registry)?;
        let remediation = RemediationMetrics::register(&registry)?;
        let postmaster = PostmasterMetrics::register(&registry)?;

        Ok(Self {
            registry,
            loops,
            resources,
            remediation,
            postmaster,
        })
    }

    /// Observe the execution duration for a monitor cycle.
    pub fn observe_duration(&self, loop_name: &str, duration: Duration) {
        self.loops
            .cycle_duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());
    }

    /// Increment the error counter for a loop.
    pub fn inc_error(&self, loop_name: &str) {
        self.loops
            .errors_total
            .with_label_values(&[loop_name])
            .inc();
    }

    /// Record the sample and alarm state published by a resource monitor.
    pub fn set_resource_metrics(
        &self,
        monitor: &str,
        sample: &Sample,
        threshold: f64,
        published: &Published,
    ) {
        let labels = &[monitor];
        match sample.value {
            Some(value) => self.resources.value.with_label_values(labels).set(value),
            None => {
                let _ = self.resources.value.remove_label_values(labels);
            }
        }
        if let Some(secondary) = sample.secondary {
            self.resources
                .secondary
                .with_label_values(labels)
                .set(secondary);
        }
        self.resources
            .threshold
            .with_label_values(labels)
            .set(threshold);
        self.resources
            .consecutive_violations
            .with_label_values(labels)
            .set(i64::from(published.consecutive_violations));
        self.resources
            .alarmed
            .with_label_values(labels)
            .set(if published.alarmed { 1 } else { 0 });
    }

    pub fn record_remediation(&self, monitor: &str, report: &RemediationReport) {
        self.remediation
            .completed_total
            .with_label_values(&[monitor])
            .inc_by(report.completed as u64);
        self.remediation
            .failed_total
            .with_label_values(&[monitor])
            .inc_by(report.failed as u64);
    }

    pub fn set_postmaster_metrics(&self, snapshot: &PhonySnapshot) {
        self.postmaster
            .phony
            .set(if snapshot.phony { 1 } else { 0 });
        self.postmaster
            .consecutive_failures
            .set(i64::from(snapshot.consecutive_failures));
    }

    pub fn inc_phony_confirmed(&self) {
        self.postmaster.confirmations_total.inc();
    }

    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct LoopMetrics {
    cycle_duration: HistogramVec,
    errors_total: IntCounterVec,
}

impl LoopMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let cycle_duration = HistogramVec::new(
            HistogramOpts::new("cycle_duration_seconds", "Monitor cycle duration"),
            &["loop"],
        )?;
        registry.register(Box::new(cycle_duration.clone()))?;

        let errors_total =
            IntCounterVec::new(Opts::new("errors_total", "Total failed cycles"), &["loop"])?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            cycle_duration,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct ResourceMetrics {
    value: GaugeVec,
    secondary: GaugeVec,
    threshold: GaugeVec,
    consecutive_violations: IntGaugeVec,
    alarmed: IntGaugeVec,
}

impl ResourceMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let value = GaugeVec::new(
            Opts::new(
                "resource_usage",
                "Last sampled value (percent, or bytes for log_size)",
            ),
            &["monitor"],
        )?;
        registry.register(Box::new(value.clone()))?;

        let secondary = GaugeVec::new(
            Opts::new("resource_total_bytes", "Capacity reported with the sample"),
            &["monitor"],
        )?;
        registry.register(Box::new(secondary.clone()))?;

        let threshold = GaugeVec::new(
            Opts::new("resource_threshold", "Limit applied to the last sample"),
            &["monitor"],
        )?;
        registry.register(Box::new(threshold.clone()))?;

        let consecutive_violations = IntGaugeVec::new(
            Opts::new(
                "resource_consecutive_violations",
                "Consecutive samples at or above the limit",
            ),
            &["monitor"],
        )?;
        registry.register(Box::new(consecutive_violations.clone()))?;

        let alarmed = IntGaugeVec::new(
            Opts::new("resource_alarmed", "Alarm flag (1=alarmed, 0=clear)"),
            &["monitor"],
        )?;
        registry.register(Box::new(alarmed.clone()))?;

        Ok(Self {
            value,
            secondary,
            threshold,
            consecutive_violations,
            alarmed,
        })
    }
}

#[derive(Clone)]
struct RemediationMetrics {
    completed_total: IntCounterVec,
    failed_total: IntCounterVec,
}

impl RemediationMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let completed_total = IntCounterVec::new(
            Opts::new("remediation_completed_total", "Remediated items"),
            &["monitor"],
        )?;
        registry.register(Box::new(completed_total.clone()))?;

        let failed_total = IntCounterVec::new(
            Opts::new("remediation_failed_total", "Items remediation failed on"),
            &["monitor"],
        )?;
        registry.register(Box::new(failed_total.clone()))?;

        Ok(Self {
            completed_total,
            failed_total,
        })
    }
}

#[derive(Clone)]
struct PostmasterMetrics {
    phony: IntGauge,
    consecutive_failures: IntGauge,
    confirmations_total: IntCounter,
}

impl PostmasterMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let phony = IntGauge::new(
            "postmaster_phony",
            "Postmaster confirmed hung (1=phony, 0=healthy)",
        )?;
        registry.register(Box::new(phony.clone()))?;

        let consecutive_failures = IntGauge::new(
            "postmaster_consecutive_failures",
            "Consecutive cycles in D-state without probe response",
        )?;
        registry.register(Box::new(consecutive_failures.clone()))?;

        let confirmations_total = IntCounter::new(
            "postmaster_phony_confirmations_total",
            "Times the postmaster was confirmed phony",
        )?;
        registry.register(Box::new(confirmations_total.clone()))?;

        Ok(Self {
            phony,
            consecutive_failures,
            confirmations_total,
        })
    }
}
