use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pgwarden::config::Thresholds;
use pgwarden::monitor::{
    Remediation, RemediationReport, ResourceKind, SampleError, ThresholdError, ThresholdProvider,
};
use pgwarden::{PeriodicMonitor, Sample};

const INTERVAL: Duration = Duration::from_secs(1);

fn thresholds() -> Arc<dyn ThresholdProvider> {
    Arc::new(Thresholds::default())
}

/// Sampler returning `values` in order, then repeating the last one.
fn sequence(
    values: Vec<f64>,
    calls: Arc<AtomicUsize>,
) -> impl FnMut() -> Result<Sample, SampleError> + Send + 'static {
    move || {
        let idx = calls.fetch_add(1, Ordering::SeqCst);
        let value = values.get(idx).or(values.last()).copied().unwrap_or_default();
        Ok(Sample::new(value))
    }
}

struct CountingRemediation(Arc<AtomicUsize>);

impl Remediation for CountingRemediation {
    fn remediate(&self) -> RemediationReport {
        self.0.fetch_add(1, Ordering::SeqCst);
        RemediationReport {
            completed: 1,
            failed: 0,
        }
    }
}

struct BrokenThresholds;

impl ThresholdProvider for BrokenThresholds {
    fn threshold(&self, kind: ResourceKind) -> Result<f64, ThresholdError> {
        Err(ThresholdError::Unavailable(kind))
    }
}

async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[tokio::test(start_paused = true)]
async fn alarm_rises_on_tenth_violation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut monitor = PeriodicMonitor::new(
        ResourceKind::Cpu,
        INTERVAL,
        sequence(vec![95.0], calls.clone()),
        thresholds(),
    );
    assert!(monitor.start());
    assert!(!monitor.start(), "second start must be rejected");

    advance(Duration::from_millis(9_500)).await;
    let state = monitor.state();
    assert_eq!(state.consecutive_violations().await, 9);
    assert!(!monitor.alarmed().await);
    assert_eq!(monitor.current_value().await, Some(95.0));

    advance(INTERVAL).await;
    assert!(monitor.alarmed().await, "tenth violation raises the alarm");
    assert!(monitor.last_updated().await.is_some());

    monitor.stop();
    monitor.join().await;
    assert!(!monitor.is_running());
}

#[tokio::test(start_paused = true)]
async fn remediation_runs_once_per_rising_edge() {
    let mut values = vec![95.0; 10];
    values.push(10.0);
    values.extend(std::iter::repeat(95.0).take(10));
    values.push(10.0);

    let calls = Arc::new(AtomicUsize::new(0));
    let remediations = Arc::new(AtomicUsize::new(0));
    let mut monitor = PeriodicMonitor::new(
        ResourceKind::Memory,
        INTERVAL,
        sequence(values, calls.clone()),
        thresholds(),
    )
    .with_remediation(CountingRemediation(remediations.clone()));
    monitor.start();

    advance(Duration::from_millis(15_500)).await;
    assert_eq!(remediations.load(Ordering::SeqCst), 1);

    advance(Duration::from_secs(15)).await;
    monitor.stop();
    monitor.join().await;

    assert_eq!(remediations.load(Ordering::SeqCst), 2);
    assert!(!monitor.alarmed().await, "low sample clears the alarm");
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_long_interval() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut monitor = PeriodicMonitor::new(
        ResourceKind::Disk,
        Duration::from_secs(3600),
        sequence(vec![50.0], calls.clone()),
        thresholds(),
    );
    monitor.start();
    advance(Duration::from_secs(5)).await;

    monitor.stop();
    tokio::time::timeout(Duration::from_secs(1), monitor.join())
        .await
        .expect("monitor exits without waiting out the interval");

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(monitor.current_value().await.is_none());
    assert!(monitor.last_updated().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn stop_before_start_never_samples() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut monitor = PeriodicMonitor::new(
        ResourceKind::Cpu,
        INTERVAL,
        sequence(vec![99.0], calls.clone()),
        thresholds(),
    );
    monitor.stop();
    monitor.stop();
    monitor.start();
    monitor.join().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(monitor.state().snapshot().await.value.is_none());
}

#[tokio::test(start_paused = true)]
async fn unavailable_capability_disables_monitor() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut monitor = PeriodicMonitor::new(
        ResourceKind::Memory,
        INTERVAL,
        move || -> Result<Sample, SampleError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SampleError::Unavailable("no memory statistics".into()))
        },
        thresholds(),
    );
    monitor.start();

    advance(Duration::from_millis(5_500)).await;
    assert!(!monitor.is_running());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    monitor.join().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_keep_monitor_running() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut monitor = PeriodicMonitor::new(
        ResourceKind::Disk,
        INTERVAL,
        move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SampleError::Failed("statvfs failed".into()))
            } else {
                Ok(Sample::with_secondary(42.0, 1.0e12))
            }
        },
        thresholds(),
    );
    monitor.start();

    advance(Duration::from_millis(2_500)).await;
    assert!(monitor.is_running());
    assert!(monitor.current_value().await.is_none());

    advance(INTERVAL).await;
    assert_eq!(monitor.current_value().await, Some(42.0));
    assert_eq!(monitor.state().secondary_value().await, Some(1.0e12));

    monitor.stop();
    monitor.join().await;
}

#[tokio::test(start_paused = true)]
async fn threshold_failure_falls_back_to_default() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut monitor = PeriodicMonitor::new(
        ResourceKind::Cpu,
        INTERVAL,
        sequence(vec![90.0], calls.clone()),
        Arc::new(BrokenThresholds),
    );
    monitor.start();

    advance(Duration::from_millis(10_500)).await;
    let snapshot = monitor.state().snapshot().await;
    assert_eq!(snapshot.threshold, Some(90.0));
    assert!(snapshot.alarmed, "value equal to the limit counts as a violation");

    monitor.stop();
    monitor.join().await;
}
