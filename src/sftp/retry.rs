//! Local copy with bounded retry for locked destinations
//!
//! A destination held open with an exclusive lock by another process (a
//! running JVM, an editor, an indexer) is retried a fixed number of times
//! with a fixed delay before giving up.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Abort, ProvisionError, StepResult};
use crate::progress::Reporter;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: usize,

    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Why a single copy attempt failed
#[derive(Debug)]
enum AttemptError {
    Locked(std::io::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Locked(e) => write!(f, "destination is locked: {}", e),
            AttemptError::Io(e) => write!(f, "{}", e),
        }
    }
}

/// Totals from [`RetryingCopier::stage_files`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub files: usize,
    pub bytes: u64,
}

/// Copy primitive with lock probing and bounded retry
#[derive(Debug, Clone, Default)]
pub struct RetryingCopier {
    config: RetryConfig,
}

impl RetryingCopier {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Copy `source` over `destination`, retrying lock and I/O failures.
    ///
    /// Emits one notice per retry. Cancellation is honored between attempts.
    pub async fn copy(
        &self,
        source: &Path,
        destination: &Path,
        reporter: &Reporter,
    ) -> StepResult<u64> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if reporter.is_cancelled() {
                return Err(Abort::Cancelled);
            }

            let (src, dst) = (source.to_path_buf(), destination.to_path_buf());
            let outcome = tokio::task::spawn_blocking(move || copy_once(&src, &dst))
                .await
                .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?;

            match outcome {
                Ok(bytes) => {
                    debug!(
                        "Copied {} -> {} ({} bytes, attempt {})",
                        source.display(),
                        destination.display(),
                        bytes,
                        attempt
                    );
                    return Ok(bytes);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt == attempts {
                        break;
                    }

                    let what = match e {
                        AttemptError::Locked(_) => "is locked",
                        AttemptError::Io(_) => "could not be written",
                    };
                    warn!(
                        "Copy to {} failed (attempt {}/{}): {}",
                        destination.display(),
                        attempt,
                        attempts,
                        last_error
                    );
                    reporter.notice(&format!(
                        "{} {}, retrying in {:?} (attempt {}/{})",
                        destination.display(),
                        what,
                        self.config.delay,
                        attempt + 1,
                        attempts
                    ));

                    let mut cancel_rx = reporter.control().subscribe_cancellation();
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.delay) => {}
                        _ = cancel_rx.changed() => {
                            if *cancel_rx.borrow() {
                                info!("Copy to {} cancelled during retry delay", destination.display());
                                return Err(Abort::Cancelled);
                            }
                        }
                    }
                }
            }
        }

        Err(ProvisionError::LockedFile {
            source_path: source.to_path_buf(),
            destination_path: destination.to_path_buf(),
            attempts,
            last_error,
        }
        .into())
    }

    /// Copy files and directory trees into `dest_dir`.
    ///
    /// A file source lands as `dest_dir/<name>`; a directory source keeps its
    /// own name and inner layout.
    pub async fn stage_files(
        &self,
        sources: &[PathBuf],
        dest_dir: &Path,
        reporter: &Reporter,
    ) -> StepResult<StageReport> {
        let plan = plan_staging(sources, dest_dir)?;
        let total = plan.len();
        info!("Staging {} file(s) into {}", total, dest_dir.display());

        let mut report = StageReport::default();
        for (index, (src, dst)) in plan.iter().enumerate() {
            if reporter.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            report.bytes += self.copy(src, dst, reporter).await?;
            report.files += 1;

            let percent = ((index + 1) * 100 / total.max(1)) as u8;
            reporter.progress(
                percent,
                &format!("Staged {}/{}: {}", index + 1, total, src.display()),
            );
        }
        Ok(report)
    }
}

/// Try for an exclusive lock on an existing destination, then copy.
fn copy_once(source: &Path, destination: &Path) -> Result<u64, AttemptError> {
    if destination.exists() {
        let file = File::options()
            .write(true)
            .open(destination)
            .map_err(AttemptError::Io)?;
        let mut lock = fd_lock::RwLock::new(file);
        let guard = lock.try_write().map_err(AttemptError::Locked)?;
        drop(guard);
    }
    std::fs::copy(source, destination).map_err(AttemptError::Io)
}

/// Expand sources into (file, destination) pairs.
fn plan_staging(sources: &[PathBuf], dest_dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>, ProvisionError> {
    let mut plan = Vec::new();
    for source in sources {
        let name = source.file_name().ok_or_else(|| {
            ProvisionError::Precondition(format!("cannot stage {}", source.display()))
        })?;

        if source.is_dir() {
            for entry in WalkDir::new(source).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    ProvisionError::Io(std::io::Error::other(format!(
                        "walking {}: {}",
                        source.display(),
                        e
                    )))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(source).map_err(|e| {
                    ProvisionError::Precondition(format!("{}: {}", entry.path().display(), e))
                })?;
                plan.push((entry.path().to_path_buf(), dest_dir.join(name).join(relative)));
            }
        } else if source.is_file() {
            plan.push((source.clone(), dest_dir.join(name)));
        } else {
            return Err(ProvisionError::Precondition(format!(
                "source does not exist: {}",
                source.display()
            )));
        }
    }
    Ok(plan)
}
