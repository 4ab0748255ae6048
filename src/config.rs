use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::monitor::{ResourceKind, ThresholdError, ThresholdProvider};

const DEFAULT_CONFIG_PATH: &str = "/etc/pgwarden/pgwarden.yaml";

/// Shortest interval any loop may run at.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Top-level configuration for the pgwarden agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sample_intervals: SampleIntervals,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub phony: PhonyConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// File the configuration was read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Resource monitor schedule (with friendly duration parsing).
#[derive(Debug, Clone, Deserialize)]
pub struct SampleIntervals {
    #[serde(default = "SampleIntervals::default_interval", with = "humantime_serde")]
    pub cpu: Duration,
    #[serde(default = "SampleIntervals::default_interval", with = "humantime_serde")]
    pub memory: Duration,
    #[serde(default = "SampleIntervals::default_interval", with = "humantime_serde")]
    pub disk: Duration,
    #[serde(default = "SampleIntervals::default_interval", with = "humantime_serde")]
    pub log: Duration,
}

impl SampleIntervals {
    const fn default_interval() -> Duration {
        Duration::from_secs(10)
    }

    pub fn for_kind(&self, kind: ResourceKind) -> Duration {
        let interval = match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Disk => self.disk,
            ResourceKind::LogSize => self.log,
        };
        interval.max(MIN_INTERVAL)
    }
}

impl Default for SampleIntervals {
    fn default() -> Self {
        Self {
            cpu: Self::default_interval(),
            memory: Self::default_interval(),
            disk: Self::default_interval(),
            log: Self::default_interval(),
        }
    }
}

/// Alarm limits. Percentages for host resources, bytes for the log volume.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Thresholds {
    #[serde(default = "Thresholds::default_percent")]
    pub cpu_use_limit: f64,
    #[serde(default = "Thresholds::default_percent")]
    pub mem_use_limit: f64,
    #[serde(default = "Thresholds::default_percent")]
    pub disk_use_limit: f64,
    #[serde(default = "Thresholds::default_log_use_limit")]
    pub log_use_limit: u64,
}

impl Thresholds {
    const fn default_percent() -> f64 {
        90.0
    }

    const fn default_log_use_limit() -> u64 {
        100 * 1024 * 1024 * 1024
    }

    pub fn limit(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_use_limit,
            ResourceKind::Memory => self.mem_use_limit,
            ResourceKind::Disk => self.disk_use_limit,
            ResourceKind::LogSize => self.log_use_limit as f64,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_use_limit: Self::default_percent(),
            mem_use_limit: Self::default_percent(),
            disk_use_limit: Self::default_percent(),
            log_use_limit: Self::default_log_use_limit(),
        }
    }
}

impl ThresholdProvider for Thresholds {
    fn threshold(&self, kind: ResourceKind) -> Result<f64, ThresholdError> {
        Ok(self.limit(kind))
    }
}

/// Re-reads the `thresholds` section of a config file on every lookup so limit changes
/// apply without restarting the agent.
#[derive(Debug, Clone)]
pub struct ThresholdFile {
    path: PathBuf,
}

#[derive(Deserialize)]
struct ThresholdSection {
    #[serde(default)]
    thresholds: Thresholds,
}

impl ThresholdFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<Thresholds, ThresholdError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| ThresholdError::Read {
            path: self.path.clone(),
            source,
        })?;
        let section: ThresholdSection =
            serde_yaml::from_str(&raw).map_err(|err| ThresholdError::Parse {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;
        Ok(section.thresholds)
    }
}

impl ThresholdProvider for ThresholdFile {
    fn threshold(&self, kind: ResourceKind) -> Result<f64, ThresholdError> {
        self.load().map(|thresholds| thresholds.limit(kind))
    }
}

/// Managed PostgreSQL instance.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "PostgresConfig::default_data_dir")]
    pub data_dir: PathBuf,
    /// Path whose filesystem is watched by the disk monitor.
    #[serde(default = "PostgresConfig::default_disk_path")]
    pub disk_path: PathBuf,
    /// Connection string for liveness probes; only accepted from the environment.
    #[serde(default)]
    pub dsn: String,
}

impl PostgresConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("/var/lib/postgresql/data")
    }

    fn default_disk_path() -> PathBuf {
        PathBuf::from("/")
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            disk_path: Self::default_disk_path(),
            dsn: String::new(),
        }
    }
}

/// Postmaster phony detection tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PhonyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "PhonyConfig::default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Consecutive failing cycles needed before the postmaster is declared phony.
    #[serde(default = "PhonyConfig::default_fail_count")]
    pub fail_count: u32,
    /// Cooldown after a confirmation during which re-confirmation is suppressed.
    #[serde(default = "PhonyConfig::default_long_cycle", with = "humantime_serde")]
    pub long_cycle: Duration,
    #[serde(
        default = "PhonyConfig::default_probe_timeout",
        with = "humantime_serde"
    )]
    pub probe_timeout: Duration,
}

impl PhonyConfig {
    const fn default_interval() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_fail_count() -> u32 {
        3
    }

    const fn default_long_cycle() -> Duration {
        Duration::from_secs(300)
    }

    const fn default_probe_timeout() -> Duration {
        Duration::from_secs(3)
    }
}

impl Default for PhonyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Self::default_interval(),
            fail_count: Self::default_fail_count(),
            long_cycle: Self::default_long_cycle(),
            probe_timeout: Self::default_probe_timeout(),
        }
    }
}

/// HTTP listener configuration (bind address).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8009".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Load configuration from YAML disk file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("PGWARDEN_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(mut cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg.source = Some(target_path);
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => parse_yaml(&raw)
            .with_context(|| format!("failed to parse YAML config at {}", path.display()))
            .map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn parse_yaml(raw: &str) -> Result<AppConfig> {
    Ok(serde_yaml::from_str(raw)?)
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.postgres.dsn.trim().is_empty() {
        bail!(
            "Remove `postgres.dsn` from the pgwarden YAML config; set the connection string via the PGWARDEN_DSN environment variable."
        );
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(data_dir) = env::var("PGWARDEN_DATA_DIR") {
        if !data_dir.is_empty() {
            config.postgres.data_dir = PathBuf::from(data_dir);
        }
    }

    match env::var("PGWARDEN_DSN") {
        Ok(dsn) => {
            if dsn.trim().is_empty() {
                bail!(
                    "Environment variable PGWARDEN_DSN is set but empty; populate it in your .env file."
                );
            }
            config.postgres.dsn = dsn;
        }
        Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    };

    Ok(())
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.phony.enabled && config.postgres.dsn.trim().is_empty() {
        bail!(
            "Missing Postgres DSN for postmaster liveness probes. Set PGWARDEN_DSN or disable `phony.enabled`."
        );
    }
    if config.phony.fail_count == 0 {
        bail!("phony.fail_count must be at least 1");
    }
    if config.phony.enabled && config.phony.interval < MIN_INTERVAL {
        bail!("phony.interval must be at least {MIN_INTERVAL:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = parse_yaml("{}").expect("parse");
        assert_eq!(cfg.thresholds, Thresholds::default());
        assert_eq!(cfg.sample_intervals.cpu, Duration::from_secs(10));
        assert_eq!(cfg.phony.fail_count, 3);
        assert_eq!(cfg.phony.long_cycle, Duration::from_secs(300));
        assert_eq!(cfg.postgres.disk_path, PathBuf::from("/"));
        assert_eq!(
            cfg.thresholds.limit(ResourceKind::LogSize),
            (100u64 * 1024 * 1024 * 1024) as f64
        );
    }

    #[test]
    fn durations_and_limits_parse() {
        let cfg = parse_yaml(
            r#"
sample_intervals:
  cpu: 5s
  log: 1m
thresholds:
  cpu_use_limit: 75
  log_use_limit: 1048576
phony:
  interval: 2s
  fail_count: 5
  long_cycle: 10m
"#,
        )
        .expect("parse");
        assert_eq!(cfg.sample_intervals.cpu, Duration::from_secs(5));
        assert_eq!(cfg.sample_intervals.log, Duration::from_secs(60));
        assert_eq!(cfg.sample_intervals.memory, Duration::from_secs(10));
        assert_eq!(cfg.thresholds.limit(ResourceKind::Cpu), 75.0);
        assert_eq!(cfg.thresholds.limit(ResourceKind::Memory), 90.0);
        assert_eq!(cfg.thresholds.limit(ResourceKind::LogSize), 1_048_576.0);
        assert_eq!(cfg.phony.fail_count, 5);
        assert_eq!(cfg.phony.long_cycle, Duration::from_secs(600));
    }

    #[test]
    fn intervals_are_clamped_to_minimum() {
        let intervals = SampleIntervals {
            disk: Duration::from_millis(10),
            ..SampleIntervals::default()
        };
        assert_eq!(intervals.for_kind(ResourceKind::Disk), MIN_INTERVAL);
    }

    #[test]
    fn dsn_in_yaml_is_rejected() {
        let cfg = parse_yaml("postgres:\n  dsn: postgres://secret@localhost/db\n").expect("parse");
        assert!(enforce_yaml_policy(&cfg).is_err());
    }

    #[test]
    fn phony_detection_requires_dsn() {
        let mut cfg = AppConfig::default();
        assert!(validate(&cfg).is_err());
        cfg.phony.enabled = false;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn phony_interval_below_minimum_is_rejected() {
        let mut cfg = parse_yaml("phony:\n  interval: 0s\n").expect("parse");
        cfg.postgres.dsn = "postgres://localhost/postgres".into();
        assert!(validate(&cfg).is_err());

        cfg.phony.interval = MIN_INTERVAL;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn threshold_file_reflects_edits_and_reports_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pgwarden.yaml");
        let provider = ThresholdFile::new(&path);

        assert!(matches!(
            provider.threshold(ResourceKind::Cpu),
            Err(ThresholdError::Read { .. })
        ));

        fs::write(&path, "thresholds:\n  cpu_use_limit: 70\n").expect("write");
        assert_eq!(provider.threshold(ResourceKind::Cpu).expect("cpu"), 70.0);

        fs::write(&path, "thresholds:\n  cpu_use_limit: 55\n").expect("rewrite");
        assert_eq!(provider.threshold(ResourceKind::Cpu).expect("cpu"), 55.0);

        fs::write(&path, "thresholds: [not, a, map]\n").expect("corrupt");
        assert!(matches!(
            provider.threshold(ResourceKind::Cpu),
            Err(ThresholdError::Parse { .. })
        ));
    }
}
