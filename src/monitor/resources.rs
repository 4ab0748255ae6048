use std::path::{Path, PathBuf};

use sysinfo::{Disk, Disks, System};

use super::{SampleError, Sampler};
use crate::state::Sample;

fn ensure_supported() -> Result<(), SampleError> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Ok(())
    } else {
        Err(SampleError::Unavailable(format!(
            "sysinfo does not support {}",
            std::env::consts::OS
        )))
    }
}

/// Host-wide CPU utilisation in percent.
///
/// CPU usage is a delta between refreshes, so the first sample after construction reads
/// as zero.
pub struct CpuSampler {
    system: System,
}

impl CpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self { system }
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for CpuSampler {
    fn sample(&mut self) -> Result<Sample, SampleError> {
        ensure_supported()?;
        self.system.refresh_cpu();
        let usage = f64::from(self.system.global_cpu_info().cpu_usage());
        Ok(Sample::new(usage))
    }
}

/// Memory in use as a percentage of total, with total bytes as secondary value.
pub struct MemorySampler {
    system: System,
}

impl MemorySampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for MemorySampler {
    fn sample(&mut self) -> Result<Sample, SampleError> {
        ensure_supported()?;
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Ok(Sample::absent());
        }
        let used = total.saturating_sub(self.system.available_memory());
        Ok(Sample::with_secondary(percent(used, total), total as f64))
    }
}

/// Usage of the filesystem holding `path`, with total bytes as secondary value.
pub struct DiskSampler {
    path: PathBuf,
}

impl DiskSampler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sampler for DiskSampler {
    fn sample(&mut self) -> Result<Sample, SampleError> {
        ensure_supported()?;
        let disks = Disks::new_with_refreshed_list();
        let Some(disk) = disk_for_path(disks.list(), &self.path) else {
            return Err(SampleError::Failed(format!(
                "no mounted filesystem found for {}",
                self.path.display()
            )));
        };

        let total = disk.total_space();
        if total == 0 {
            return Ok(Sample::absent());
        }
        let used = total.saturating_sub(disk.available_space());
        Ok(Sample::with_secondary(percent(used, total), total as f64))
    }
}

/// Picks the disk whose mount point is the longest prefix of `path`.
fn disk_for_path<'a>(disks: &'a [Disk], path: &Path) -> Option<&'a Disk> {
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().components().count())
}

fn percent(used: u64, total: u64) -> f64 {
    used as f64 / total as f64 * 100.0
}
