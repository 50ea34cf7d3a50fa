//! Remote archive creation

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, info, warn};

use super::matcher::{entries_to_percent, LineMatcher, RegexLineMatcher, ZipVerboseMatcher};
use crate::config::PipelineSettings;
use crate::error::{Abort, ProvisionError, StepResult};
use crate::progress::{phases, PhaseBand, Reporter};
use crate::session::Session;
use crate::sftp::path_utils::{join_remote_path, shell_quote, unique_temp_name};

const ARCHIVE_PREFIX: &str = "provision";

/// Zips a directory on the remote host into a temp archive.
pub struct RemoteArchiver {
    settings: PipelineSettings,
    matcher: Box<dyn LineMatcher>,
    band: PhaseBand,
}

impl RemoteArchiver {
    pub fn new(settings: PipelineSettings) -> Result<Self, ProvisionError> {
        settings.validate_paths().map_err(ProvisionError::Config)?;
        let matcher: Box<dyn LineMatcher> = match &settings.entry_pattern {
            Some(pattern) => Box::new(RegexLineMatcher::new(pattern).map_err(|e| {
                ProvisionError::Config(format!("invalid entry_pattern {:?}: {}", pattern, e))
            })?),
            None => Box::new(ZipVerboseMatcher),
        };
        Ok(Self {
            settings,
            matcher,
            band: phases::ARCHIVE,
        })
    }

    pub fn with_matcher(mut self, matcher: Box<dyn LineMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// `<$ENV_VAR>/<suffix>`, verified to exist.
    pub async fn resolve_source_dir(&self, session: &Session) -> StepResult<String> {
        let timeout = self.settings.command_timeout();
        let root = session
            .resolve_env_var(&self.settings.env_var, timeout)
            .await?;
        let dir = join_remote_path(root.trim_end_matches('/'), &self.settings.remote_suffix);

        let check = session
            .run_command(&format!("test -d {}", shell_quote(&dir)), timeout, None)
            .await?;
        if !check.success() {
            return Err(ProvisionError::Precondition(format!(
                "remote directory does not exist: {}",
                dir
            ))
            .into());
        }
        Ok(dir)
    }

    /// Build the archive and return its remote path.
    ///
    /// The archive is tracked on the session from before the command runs
    /// until the downloader deletes it.
    pub async fn create_archive(&self, session: &Session, reporter: &Reporter) -> StepResult<String> {
        reporter.progress(self.band.start, "Resolving remote directory");
        let dir = self.resolve_source_dir(session).await?;

        let archive = join_remote_path(
            &self.settings.remote_temp_dir,
            &unique_temp_name(ARCHIVE_PREFIX, session.id(), "zip"),
        );
        session.track_remote_file(&archive);

        let command = archive_command(
            &dir,
            &archive,
            &self.settings.exclusion,
            &self.settings.completion_marker,
        );
        info!("[{}] archiving {} into {}", session.id(), dir, archive);
        reporter.progress(self.band.start, &format!("Archiving {}", dir));

        let entries = AtomicUsize::new(0);
        let band = self.band;
        let on_line = |line: &str| {
            if self.matcher.is_entry(line) {
                let n = entries.fetch_add(1, Ordering::SeqCst) + 1;
                reporter.progress(
                    entries_to_percent(band, n),
                    &format!("Archiving: {} files", n),
                );
            }
        };

        let result = match session
            .run_command(&command, self.settings.archive_timeout(), Some(&on_line))
            .await
        {
            Ok(result) => result,
            Err(Abort::Cancelled) => {
                info!("[{}] archive cancelled, removing {}", session.id(), archive);
                if let Err(e) = session.delete_remote_file(&archive).await {
                    warn!("[{}] could not remove partial archive: {}", session.id(), e);
                }
                return Err(Abort::Cancelled);
            }
            Err(Abort::Failed(e)) => {
                error!("[{}] archive command failed: {}", session.id(), e);
                return Err(Abort::Failed(e));
            }
        };

        let marker = self.settings.completion_marker.as_str();
        let has_marker = result.output.lines().any(|line| line.trim() == marker);
        if !has_marker || !result.success() {
            let reason = if result.success() {
                "completion marker missing".to_string()
            } else {
                format!("exit code {:?}", result.exit_code)
            };
            error!(
                "[{}] archive of {} failed ({}): {}",
                session.id(),
                dir,
                reason,
                command
            );
            return Err(ProvisionError::CommandFailed {
                command,
                exit_code: result.exit_code,
                reason,
                output: result.output,
            }
            .into());
        }

        let count = entries.load(Ordering::SeqCst);
        info!("[{}] archive ready: {} ({} entries)", session.id(), archive, count);
        reporter.progress(
            self.band.end,
            &format!("Archive created ({} files)", count),
        );
        Ok(archive)
    }
}

/// `cd DIR && zip -r ARCHIVE . -x 'EXCL/*' && chmod 644 ARCHIVE && echo MARKER`
///
/// Chained with `&&` so the marker is printed only if every step succeeded.
pub fn archive_command(dir: &str, archive: &str, exclusion: &str, marker: &str) -> String {
    let archive = shell_quote(archive);
    let exclude = if exclusion.is_empty() {
        String::new()
    } else {
        format!(" -x {}", shell_quote(&format!("{}/*", exclusion.trim_end_matches('/'))))
    };
    format!(
        "cd {} && zip -r {} .{} && chmod 644 {} && echo {}",
        shell_quote(dir),
        archive,
        exclude,
        archive,
        shell_quote(marker)
    )
}
