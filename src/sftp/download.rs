//! Archive download with a polling progress observer
//!
//! The transfer itself reports nothing. A sibling task samples the size of
//! the growing local file and turns it into download-band progress.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::path_utils::{remote_file_name, unique_temp_name};
use super::progress::{format_bytes, TransferProgress};
use crate::error::{Abort, StepResult};
use crate::progress::{phases, PhaseBand, Reporter};
use crate::session::Session;

/// How often the observer samples the local file
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum spacing between observer progress reports
const EMIT_INTERVAL: Duration = Duration::from_secs(1);

const LOCAL_ARCHIVE_PREFIX: &str = "provision";

/// Pulls a remote archive into the local temp directory.
pub struct Downloader {
    local_temp_dir: PathBuf,
    band: PhaseBand,
}

impl Downloader {
    pub fn new(local_temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_temp_dir: local_temp_dir.into(),
            band: phases::DOWNLOAD,
        }
    }

    /// Download `remote_archive` and delete it from the remote host.
    ///
    /// Returns the local archive path, which stays tracked on the session.
    pub async fn download(
        &self,
        session: &Session,
        remote_archive: &str,
        reporter: &Reporter,
    ) -> StepResult<PathBuf> {
        if reporter.is_cancelled() {
            discard_remote(session, remote_archive).await;
            return Err(Abort::Cancelled);
        }

        let channel = session.open_transfer_channel().await?;
        let total = channel.size(remote_archive).await?;

        let local = self
            .local_temp_dir
            .join(unique_temp_name(LOCAL_ARCHIVE_PREFIX, session.id(), "zip"));
        session.track_local_file(&local);

        let label = format!("Downloading {}", remote_file_name(remote_archive));
        info!(
            "[{}] {} ({}) -> {}",
            session.id(),
            remote_archive,
            format_bytes(total),
            local.display()
        );
        reporter.progress(self.band.start, &label);

        let done = Arc::new(AtomicBool::new(false));
        let observer = tokio::spawn(observe_local_size(
            TransferProgress::new(remote_archive.to_string(), local.clone(), total),
            done.clone(),
            reporter.clone(),
            self.band,
            label,
        ));

        let result = channel.get(remote_archive, &local, session.control()).await;

        done.store(true, Ordering::SeqCst);
        let mut record = match observer.await {
            Ok(record) => record,
            Err(e) => {
                warn!("[{}] download observer failed: {}", session.id(), e);
                TransferProgress::new(remote_archive.to_string(), local.clone(), total)
            }
        };

        match result {
            Ok(bytes) => {
                record.update_progress(bytes);
                record.mark_completed();
                info!(
                    "[{}] downloaded {} at {}/s",
                    session.id(),
                    format_bytes(bytes),
                    format_bytes(record.bytes_per_second() as u64)
                );
                reporter.progress(
                    self.band.end,
                    &format!("Downloaded {}", format_bytes(bytes)),
                );
                discard_remote(session, remote_archive).await;
                Ok(local)
            }
            Err(Abort::Cancelled) => {
                record.mark_cancelled();
                info!(
                    "[{}] download cancelled after {}",
                    session.id(),
                    format_bytes(record.transferred_bytes)
                );
                discard_local(session, &local).await;
                discard_remote(session, remote_archive).await;
                Err(Abort::Cancelled)
            }
            Err(Abort::Failed(e)) => {
                record.mark_failed(e.to_string());
                error!(
                    "[{}] download of {} failed after {}: {}",
                    session.id(),
                    remote_archive,
                    format_bytes(record.transferred_bytes),
                    e
                );
                Err(Abort::Failed(e))
            }
        }
    }
}

/// Sample the local file until the transfer is done, cancelled, or complete.
/// Returns the last sample.
async fn observe_local_size(
    mut progress: TransferProgress,
    done: Arc<AtomicBool>,
    reporter: Reporter,
    band: PhaseBand,
    label: String,
) -> TransferProgress {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_emit: Option<Instant> = None;

    loop {
        ticker.tick().await;
        if done.load(Ordering::SeqCst) || reporter.is_cancelled() {
            break;
        }

        let size = match tokio::fs::metadata(&progress.destination_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        progress.update_progress(size);

        if last_emit.map_or(true, |t| t.elapsed() >= EMIT_INTERVAL) {
            reporter.progress(
                band.at_fraction(progress.fraction()),
                &progress.status_line(&label),
            );
            last_emit = Some(Instant::now());
        }

        if progress.total_bytes > 0 && size >= progress.total_bytes {
            break;
        }
    }
    debug!(
        "Observer for {} stopped at {} bytes",
        progress.source_path, progress.transferred_bytes
    );
    progress
}

async fn discard_local(session: &Session, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            // Keep it tracked so close() tries again
            warn!("[{}] could not remove {}: {}", session.id(), path.display(), e);
            return;
        }
    }
    session.untrack_local_file(path);
}

async fn discard_remote(session: &Session, remote: &str) {
    if let Err(e) = session.delete_remote_file(remote).await {
        warn!("[{}] could not remove {}: {}", session.id(), remote, e);
    }
}
