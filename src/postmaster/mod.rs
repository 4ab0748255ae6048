//! Postmaster liveness ("phony") detection.
//!
//! A postmaster is phony when its process sits in uninterruptible I/O wait and it stops
//! answering connection attempts for `fail_count` consecutive cycles. A confirmation
//! starts a cooldown (`long_cycle`) during which further qualifying runs are only
//! reported as suspected, so one stall cannot trigger repeated failovers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::PhonyConfig;
use crate::metrics::AppMetrics;
use crate::monitor::StopSignal;

mod probe;

pub use probe::{PgIsReady, PidFileLocator, SysinfoInspector};

const LOOP_NAME: &str = "postmaster";

/// Resolves the PID of the managed postmaster.
pub trait PostmasterLocator: Send + Sync + 'static {
    /// `None` when no postmaster is running.
    fn postmaster_pid(&self) -> Option<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Blocked in uninterruptible I/O (`D` in `ps`).
    UninterruptibleWait,
    Other,
}

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("process {0} does not exist")]
    NoSuchProcess(u32),
    #[error("failed to inspect process {pid}: {reason}")]
    Failed { pid: u32, reason: String },
}

/// Reads a process's scheduling state.
pub trait ProcessInspector: Send + 'static {
    fn inspect(&mut self, pid: u32) -> Result<ProcessState, InspectError>;
}

/// Server answer classified like `pg_isready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Accepting,
    Rejecting,
    NoResponse,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection probe timed out")]
    Timeout,
    #[error("connection probe failed: {0}")]
    Failed(String),
}

pub type ProbeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ProbeStatus, ProbeError>> + Send + 'a>>;

/// Attempts a connection to the database.
pub trait ConnectivityProbe: Send + Sync + 'static {
    fn probe(&self) -> ProbeFuture<'_>;
}

/// Result of feeding one cycle into [`PhonyState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Failing, but fewer than `fail_count` cycles in a row.
    Failing { failures: u32 },
    /// Enough failures, but inside the cooldown of an earlier confirmation.
    Suspected { failures: u32 },
    Confirmed { failures: u32 },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PhonySnapshot {
    pub phony: bool,
    pub consecutive_failures: u32,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_confirmed_at: Option<DateTime<Utc>>,
}

/// Suspicion/confirmation state machine.
#[derive(Debug, Default)]
pub struct PhonyState {
    consecutive_failures: u32,
    phony: bool,
    last_confirmed: Option<Instant>,
    last_confirmed_at: Option<DateTime<Utc>>,
}

impl PhonyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one cycle's observation. The failure counter keeps growing during the
    /// cooldown; only the transition to phony is gated.
    pub fn observe(&mut self, failing: bool, now: Instant, config: &PhonyConfig) -> Verdict {
        if !failing {
            self.consecutive_failures = 0;
            return Verdict::Healthy;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let failures = self.consecutive_failures;
        if failures < config.fail_count {
            return Verdict::Failing { failures };
        }

        let cooling_down = self
            .last_confirmed
            .is_some_and(|at| now.saturating_duration_since(at) < config.long_cycle);
        if cooling_down {
            return Verdict::Suspected { failures };
        }

        self.phony = true;
        self.last_confirmed = Some(now);
        self.last_confirmed_at = Some(Utc::now());
        Verdict::Confirmed { failures }
    }

    /// Clear the phony flag and the failure counter. The cooldown still applies.
    pub fn recover(&mut self) {
        self.phony = false;
        self.consecutive_failures = 0;
    }

    pub fn is_phony(&self) -> bool {
        self.phony
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn snapshot(&self) -> PhonySnapshot {
        PhonySnapshot {
            phony: self.phony,
            consecutive_failures: self.consecutive_failures,
            last_confirmed_at: self.last_confirmed_at,
        }
    }
}

/// Cloneable accessor handed to the orchestration layer.
#[derive(Clone, Default)]
pub struct PhonyHandle {
    state: Arc<RwLock<PhonyState>>,
}

impl PhonyHandle {
    pub async fn is_phony(&self) -> bool {
        self.state.read().await.is_phony()
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.read().await.consecutive_failures()
    }

    pub async fn snapshot(&self) -> PhonySnapshot {
        self.state.read().await.snapshot()
    }

    /// Called once orchestration has acted on a phony postmaster.
    pub async fn recover(&self) -> PhonySnapshot {
        let mut guard = self.state.write().await;
        guard.recover();
        info!("postmaster phony state recovered");
        guard.snapshot()
    }
}

/// Background task running the phony state machine for one postmaster.
pub struct PhonyDetector {
    handle: PhonyHandle,
    stop: StopSignal,
    worker: Option<DetectorWorker>,
    task: Option<JoinHandle<()>>,
}

impl PhonyDetector {
    pub fn new<L, I, P>(config: PhonyConfig, locator: L, inspector: I, probe: P) -> Self
    where
        L: PostmasterLocator,
        I: ProcessInspector,
        P: ConnectivityProbe,
    {
        let handle = PhonyHandle::default();
        let stop = StopSignal::new();
        let worker = DetectorWorker {
            config,
            locator: Box::new(locator),
            inspector: Box::new(inspector),
            probe: Box::new(probe),
            metrics: None,
            handle: handle.clone(),
            stop: stop.clone(),
        };
        Self {
            handle,
            stop,
            worker: Some(worker),
            task: None,
        }
    }

    pub fn with_metrics(mut self, metrics: AppMetrics) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.metrics = Some(metrics);
        }
        self
    }

    /// Spawn the detector loop. Returns `false` if it was already started.
    pub fn start(&mut self) -> bool {
        match self.worker.take() {
            Some(worker) => {
                self.task = Some(tokio::spawn(worker.run()));
                true
            }
            None => {
                warn!("phony detector already started");
                false
            }
        }
    }

    /// Request the loop to exit. Idempotent and valid before [`start`](Self::start).
    pub fn stop(&self) {
        self.stop.request();
    }

    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(error = ?err, "phony detector task aborted");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn handle(&self) -> PhonyHandle {
        self.handle.clone()
    }

    pub async fn is_phony(&self) -> bool {
        self.handle.is_phony().await
    }

    pub async fn snapshot(&self) -> PhonySnapshot {
        self.handle.snapshot().await
    }

    pub async fn recover(&self) -> PhonySnapshot {
        self.handle.recover().await
    }
}

struct DetectorWorker {
    config: PhonyConfig,
    locator: Box<dyn PostmasterLocator>,
    inspector: Box<dyn ProcessInspector>,
    probe: Box<dyn ConnectivityProbe>,
    metrics: Option<AppMetrics>,
    handle: PhonyHandle,
    stop: StopSignal,
}

impl DetectorWorker {
    async fn run(mut self) {
        info!(
            interval = ?self.config.interval,
            fail_count = self.config.fail_count,
            long_cycle = ?self.config.long_cycle,
            "starting postmaster phony detector"
        );

        while !self.stop.is_requested() {
            match self.run_cycle().await {
                Some(verdict) => self.report(verdict),
                None => break,
            }

            if self.stop.sleep(self.config.interval).await {
                break;
            }
        }

        info!("stopping postmaster phony detector");
    }

    /// One observation. `None` means stop was requested and nothing was published.
    async fn run_cycle(&mut self) -> Option<Verdict> {
        let failing = self.is_failing().await;
        let now = Instant::now();

        let mut guard = self.handle.state.write().await;
        if self.stop.is_requested() {
            return None;
        }
        let verdict = guard.observe(failing, now, &self.config);
        let snapshot = guard.snapshot();
        drop(guard);

        if let Some(metrics) = &self.metrics {
            metrics.set_postmaster_metrics(&snapshot);
        }
        Some(verdict)
    }

    /// D-state and unresponsive in this cycle. A state that cannot be read is not failing,
    /// so the run of consecutive failures restarts.
    async fn is_failing(&mut self) -> bool {
        let Some(pid) = self.locator.postmaster_pid() else {
            debug!("postmaster not running");
            return false;
        };

        match self.inspector.inspect(pid) {
            Ok(ProcessState::UninterruptibleWait) => {}
            Ok(ProcessState::Other) => return false,
            Err(InspectError::NoSuchProcess(pid)) => {
                debug!(pid, "postmaster process not found");
                return false;
            }
            Err(err) => {
                error!(error = %err, "failed to inspect postmaster state");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_error(LOOP_NAME);
                }
                return false;
            }
        }

        debug!(pid, "postmaster in uninterruptible wait; probing connectivity");
        unresponsive(&*self.probe, self.config.probe_timeout).await
    }

    fn report(&self, verdict: Verdict) {
        let fail_count = self.config.fail_count;
        match verdict {
            Verdict::Healthy => {}
            Verdict::Failing { failures } => {
                info!("postgres D-state detected ({failures}/{fail_count})");
            }
            Verdict::Suspected { failures } => {
                info!("postmaster phony suspected ({failures}/{fail_count})");
            }
            Verdict::Confirmed { failures } => {
                warn!("postmaster phony confirmed ({failures}/{fail_count})");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_phony_confirmed();
                }
            }
        }
    }
}

/// A timeout counts as no response; any other probe error is inconclusive.
async fn unresponsive(probe: &dyn ConnectivityProbe, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, probe.probe()).await {
        Err(_) | Ok(Err(ProbeError::Timeout)) => true,
        Ok(Ok(status)) => status == ProbeStatus::NoResponse,
        Ok(Err(err)) => {
            debug!(error = %err, "connection probe inconclusive");
            false
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn config(fail_count: u32, long_cycle_secs: u64) -> PhonyConfig {
        PhonyConfig {
            fail_count,
            long_cycle: Duration::from_secs(long_cycle_secs),
            ..PhonyConfig::default()
        }
    }

    #[test]
    fn confirms_on_fail_count() {
        let cfg = config(3, 300);
        let mut state = PhonyState::new();
        let start = Instant::now();

        assert_eq!(state.observe(true, start, &cfg), Verdict::Failing { failures: 1 });
        assert_eq!(state.observe(true, start, &cfg), Verdict::Failing { failures: 2 });
        assert!(!state.is_phony());
        assert_eq!(state.observe(true, start, &cfg), Verdict::Confirmed { failures: 3 });
        assert!(state.is_phony());
        assert!(state.snapshot().last_confirmed_at.is_some());
    }

    #[test]
    fn healthy_cycle_resets_counter_but_not_phony() {
        let cfg = config(2, 300);
        let mut state = PhonyState::new();
        let now = Instant::now();

        state.observe(true, now, &cfg);
        assert_eq!(state.observe(false, now, &cfg), Verdict::Healthy);
        assert_eq!(state.consecutive_failures(), 0);

        state.observe(true, now, &cfg);
        state.observe(true, now, &cfg);
        assert!(state.is_phony());
        assert_eq!(state.observe(false, now, &cfg), Verdict::Healthy);
        assert!(state.is_phony(), "only recover() clears phony");
    }

    #[test]
    fn recover_resets_flag_and_counter() {
        let cfg = config(1, 300);
        let mut state = PhonyState::new();
        state.observe(true, Instant::now(), &cfg);
        assert!(state.is_phony());

        state.recover();
        assert!(!state.is_phony());
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn cooldown_suppresses_reconfirmation_after_recover() {
        let cfg = config(3, 300);
        let mut state = PhonyState::new();
        let start = Instant::now();

        for _ in 0..3 {
            state.observe(true, start, &cfg);
        }
        assert!(state.is_phony());
        let first = state.snapshot().last_confirmed_at;
        state.recover();

        let within = start + Duration::from_secs(100);
        assert_eq!(state.observe(true, within, &cfg), Verdict::Failing { failures: 1 });
        assert_eq!(state.observe(true, within, &cfg), Verdict::Failing { failures: 2 });
        assert_eq!(state.observe(true, within, &cfg), Verdict::Suspected { failures: 3 });
        assert_eq!(state.observe(true, within, &cfg), Verdict::Suspected { failures: 4 });
        assert!(!state.is_phony());
        assert_eq!(state.snapshot().last_confirmed_at, first);

        let after = start + Duration::from_secs(300);
        assert_eq!(state.observe(true, after, &cfg), Verdict::Confirmed { failures: 5 });
        assert!(state.is_phony());
    }

    #[test]
    fn cooldown_keeps_existing_confirmation() {
        let cfg = config(2, 60);
        let mut state = PhonyState::new();
        let start = Instant::now();

        state.observe(true, start, &cfg);
        state.observe(true, start, &cfg);
        assert!(state.is_phony());

        let within = start + Duration::from_secs(30);
        assert_eq!(state.observe(true, within, &cfg), Verdict::Suspected { failures: 3 });
        assert!(state.is_phony());
    }
}
