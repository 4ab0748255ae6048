use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use super::{Remediation, RemediationReport, SampleError, Sampler};
use crate::state::Sample;

pub const LOG_SUFFIX: &str = ".log";
pub const COMPRESSED_SUFFIX: &str = ".gz";

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Recursively list regular files under `dir` whose name ends in `.log`.
///
/// Unreadable entries are skipped; a missing directory yields no files.
pub fn find_log_files(dir: &Path) -> Vec<LogFile> {
    if !dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .as_encoded_bytes()
                .ends_with(LOG_SUFFIX.as_bytes())
        })
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            Some(LogFile {
                size: metadata.len(),
                modified: metadata.modified().ok(),
                path: entry.into_path(),
            })
        })
        .collect()
}

/// Total size in bytes of the `.log` files under the data directory.
pub struct LogSizeSampler {
    data_dir: PathBuf,
}

impl LogSizeSampler {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

impl Sampler for LogSizeSampler {
    fn sample(&mut self) -> Result<Sample, SampleError> {
        let total: u64 = find_log_files(&self.data_dir)
            .iter()
            .map(|file| file.size)
            .sum();
        Ok(Sample::new(total as f64))
    }
}

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create {}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("compressed but could not remove original {}", path.display())]
    RemoveOriginal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default)]
pub struct CompressionReport {
    pub compressed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    pub skipped: Option<PathBuf>,
}

/// Gzips every `.log` file under the data directory except the most recently modified
/// one, which the postmaster is presumably still writing.
pub struct LogCompressor {
    data_dir: PathBuf,
}

impl LogCompressor {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn compress_all(&self) -> CompressionReport {
        let files = find_log_files(&self.data_dir);
        let newest = newest_log(&files).map(Path::to_path_buf);
        let mut report = CompressionReport::default();

        for file in files {
            if newest.as_deref() == Some(file.path.as_path()) {
                info!(path = %file.path.display(), "skipping compression of newest log file");
                report.skipped = Some(file.path);
                continue;
            }

            match compress_file(&file.path) {
                Ok(target) => {
                    info!(
                        path = %file.path.display(),
                        target = %target.display(),
                        bytes = file.size,
                        "compressed log file"
                    );
                    report.compressed.push(file.path);
                }
                Err(err) => {
                    error!(path = %file.path.display(), error = %err, "failed to compress log file");
                    report.failed.push(file.path);
                }
            }
        }

        report
    }
}

impl Remediation for LogCompressor {
    fn remediate(&self) -> RemediationReport {
        let report = self.compress_all();
        RemediationReport {
            completed: report.compressed.len(),
            failed: report.failed.len(),
        }
    }
}

fn newest_log(files: &[LogFile]) -> Option<&Path> {
    files
        .iter()
        .filter_map(|file| file.modified.map(|modified| (modified, file.path.as_path())))
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(COMPRESSED_SUFFIX);
    PathBuf::from(name)
}

/// Stream `path` into `<path>.gz` and remove the original once the archive is complete.
///
/// An existing archive is never overwritten. A partially written archive is removed.
pub fn compress_file(path: &Path) -> Result<PathBuf, CompressError> {
    let target = compressed_path(path);
    let input = File::open(path).map_err(|source| CompressError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .map_err(|source| CompressError::Create {
            path: target.clone(),
            source,
        })?;

    if let Err(source) = write_gzip(input, output) {
        if let Err(err) = fs::remove_file(&target) {
            debug!(path = %target.display(), error = %err, "failed to remove partial archive");
        }
        return Err(CompressError::Write {
            path: target,
            source,
        });
    }

    fs::remove_file(path).map_err(|source| CompressError::RemoveOriginal {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(target)
}

fn write_gzip(input: File, output: File) -> io::Result<()> {
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, input);
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    let output = encoder.finish()?;
    output.sync_all()
}
