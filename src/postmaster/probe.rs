use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::str::FromStr;

use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection};
use sysinfo::{Pid, ProcessStatus, System};
use tracing::debug;

use super::{
    ConnectivityProbe, InspectError, PostmasterLocator, ProbeError, ProbeFuture, ProbeStatus,
    ProcessInspector, ProcessState,
};

const PID_FILE: &str = "postmaster.pid";
/// SQLSTATE `cannot_connect_now`: server is starting up or shutting down.
const CANNOT_CONNECT_NOW: &str = "57P03";

/// Reads the postmaster PID from the first line of `<data_dir>/postmaster.pid`.
#[derive(Debug, Clone)]
pub struct PidFileLocator {
    data_dir: PathBuf,
}

impl PidFileLocator {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

impl PostmasterLocator for PidFileLocator {
    fn postmaster_pid(&self) -> Option<u32> {
        let path = self.data_dir.join(PID_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "failed to read postmaster pid file");
                return None;
            }
        };
        parse_pid(&raw)
    }
}

fn parse_pid(raw: &str) -> Option<u32> {
    raw.lines()
        .next()
        .and_then(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}

/// Scheduling state lookup through `sysinfo`.
pub struct SysinfoInspector {
    system: System,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SysinfoInspector {
    fn inspect(&mut self, pid: u32) -> Result<ProcessState, InspectError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(InspectError::Failed {
                pid,
                reason: format!("process inspection unsupported on {}", std::env::consts::OS),
            });
        }

        let sys_pid = Pid::from_u32(pid);
        if !self.system.refresh_process(sys_pid) {
            return Err(InspectError::NoSuchProcess(pid));
        }
        let process = self
            .system
            .process(sys_pid)
            .ok_or(InspectError::NoSuchProcess(pid))?;

        Ok(match process.status() {
            ProcessStatus::UninterruptibleDiskSleep => ProcessState::UninterruptibleWait,
            _ => ProcessState::Other,
        })
    }
}

/// Connection attempt classified the way `pg_isready` reports it.
#[derive(Debug, Clone)]
pub struct PgIsReady {
    options: PgConnectOptions,
}

impl PgIsReady {
    pub fn from_dsn(dsn: &str) -> Result<Self, sqlx::Error> {
        let options = PgConnectOptions::from_str(dsn)?.application_name("pgwarden");
        Ok(Self { options })
    }
}

impl ConnectivityProbe for PgIsReady {
    fn probe(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            match self.options.connect().await {
                Ok(conn) => {
                    if let Err(err) = conn.close().await {
                        debug!(error = %err, "failed to close probe connection");
                    }
                    Ok(ProbeStatus::Accepting)
                }
                Err(err) => classify(err),
            }
        })
    }
}

/// A server that answers at all, even with an authentication error, is accepting.
fn classify(err: sqlx::Error) -> Result<ProbeStatus, ProbeError> {
    match err {
        sqlx::Error::Io(io) if io.kind() == ErrorKind::TimedOut => Err(ProbeError::Timeout),
        sqlx::Error::Io(_) => Ok(ProbeStatus::NoResponse),
        sqlx::Error::Database(db) if db.code().as_deref() == Some(CANNOT_CONNECT_NOW) => {
            Ok(ProbeStatus::Rejecting)
        }
        sqlx::Error::Database(_) => Ok(ProbeStatus::Accepting),
        other => Err(ProbeError::Failed(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn pid_is_first_line_of_pid_file() {
        assert_eq!(parse_pid("4242\n/var/lib/postgresql/data\n1700000000\n"), Some(4242));
        assert_eq!(parse_pid("  17  \n"), Some(17));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("0\n"), None);
        assert_eq!(parse_pid("-1\n"), None);
        assert_eq!(parse_pid("garbage\n"), None);
    }

    #[test]
    fn locator_reads_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locator = PidFileLocator::new(dir.path());
        assert_eq!(locator.postmaster_pid(), None);

        fs::write(dir.path().join(PID_FILE), "9876\n/data\n").expect("write pid file");
        assert_eq!(locator.postmaster_pid(), Some(9876));
    }

    #[test]
    fn io_failures_mean_no_response() {
        let refused = sqlx::Error::Io(io::Error::from(ErrorKind::ConnectionRefused));
        assert!(matches!(classify(refused), Ok(ProbeStatus::NoResponse)));

        let timed_out = sqlx::Error::Io(io::Error::from(ErrorKind::TimedOut));
        assert!(matches!(classify(timed_out), Err(ProbeError::Timeout)));
    }

    #[test]
    fn other_failures_are_inconclusive() {
        let protocol = sqlx::Error::Protocol("unexpected message".into());
        assert!(matches!(classify(protocol), Err(ProbeError::Failed(_))));
    }

    #[test]
    fn inspecting_own_process_is_not_d_state() {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }
        let mut inspector = SysinfoInspector::new();
        let state = inspector.inspect(std::process::id()).expect("inspect self");
        assert_eq!(state, ProcessState::Other);
    }
}
