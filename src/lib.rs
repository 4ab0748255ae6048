pub mod alarm;
pub mod app;
pub mod config;
pub mod http;
pub mod metrics;
pub mod monitor;
pub mod postmaster;
pub mod state;

pub use alarm::{ALARM_EDGE_COUNT, HysteresisAlarm};
pub use app::{Agent, AppContext};
pub use monitor::{PeriodicMonitor, ResourceKind, StopSignal};
pub use postmaster::{PhonyDetector, PhonyHandle};
pub use state::{Sample, SharedMonitorState};
