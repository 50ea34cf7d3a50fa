//! Provisioning pipeline
//!
//! archive → download → extract → cleanup, run as one registered session.
//! Whatever the outcome, the session is closed (sweeping every tracked temp
//! file) and unregistered before the callback hears about it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::archive::{Extractor, RemoteArchiver};
use crate::config::PipelineSettings;
use crate::error::{Abort, ProvisionError, StepResult};
use crate::progress::{phases, ProgressCallback, Reporter};
use crate::session::{Connector, Session, SessionRegistry};
use crate::sftp::Downloader;

/// Summary of a completed run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub session_id: String,
    pub remote_archive: String,
    pub destination: PathBuf,
    pub files: usize,
    pub elapsed: Duration,
}

/// Terminal state of one pipeline run
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed(ProvisionReport),
    Cancelled,
    Failed(ProvisionError),
}

pub struct ProvisionPipeline {
    settings: PipelineSettings,
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
}

impl ProvisionPipeline {
    pub fn new(
        settings: PipelineSettings,
        connector: Arc<dyn Connector>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            settings,
            connector,
            registry,
        }
    }

    /// Run on a dedicated task.
    pub fn spawn(self: Arc<Self>, callback: Arc<dyn ProgressCallback>) -> JoinHandle<PipelineOutcome> {
        tokio::spawn(async move { self.run(callback).await })
    }

    /// Run to completion. Exactly one of `on_complete`, `on_error` or
    /// `on_cancelled` is called, after cleanup has finished.
    pub async fn run(&self, callback: Arc<dyn ProgressCallback>) -> PipelineOutcome {
        let started = Instant::now();

        let archiver = match RemoteArchiver::new(self.settings.clone()) {
            Ok(archiver) => archiver,
            Err(e) => return fail(callback.as_ref(), e),
        };

        let session =
            match Session::open(self.connector.as_ref(), &self.settings.purpose, &self.registry)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    error!("Could not open session to {}: {}", self.connector.target(), e);
                    return fail(callback.as_ref(), e);
                }
            };
        let id = session.id().to_string();
        self.registry.set_in_progress(&id, true);

        let reporter = Reporter::new(callback.clone(), session.control().clone());
        let result = self.execute(&session, &archiver, &reporter).await;

        match &result {
            Ok(_) => reporter.progress(phases::CLEANUP.start, "Cleaning up"),
            Err(_) => reporter.notice("Cleaning up"),
        }
        session.close().await;
        self.registry.set_in_progress(&id, false);
        if self.registry.unregister(&id).is_none() {
            // Already removed by a forced shutdown
            warn!("[{}] session was no longer registered", id);
        }

        match result {
            Ok((remote_archive, files)) => {
                let report = ProvisionReport {
                    session_id: id,
                    remote_archive,
                    destination: self.settings.local_target_dir(),
                    files,
                    elapsed: started.elapsed(),
                };
                info!(
                    "[{}] provisioned {} files into {} in {:.1}s",
                    report.session_id,
                    report.files,
                    report.destination.display(),
                    report.elapsed.as_secs_f64()
                );
                reporter.progress(phases::CLEANUP.end, "Done");
                callback.on_complete(&format!(
                    "Provisioned {} files into {}",
                    report.files,
                    report.destination.display()
                ));
                PipelineOutcome::Completed(report)
            }
            Err(Abort::Cancelled) => {
                info!("[{}] provisioning cancelled", id);
                callback.on_cancelled(&Abort::Cancelled.to_string());
                PipelineOutcome::Cancelled
            }
            Err(Abort::Failed(e)) => {
                error!("[{}] provisioning failed: {}", id, e);
                fail(callback.as_ref(), e)
            }
        }
    }

    async fn execute(
        &self,
        session: &Session,
        archiver: &RemoteArchiver,
        reporter: &Reporter,
    ) -> StepResult<(String, usize)> {
        let remote_archive = archiver.create_archive(session, reporter).await?;

        let temp_dir = self.settings.local_temp_dir();
        if let Err(e) = tokio::fs::create_dir_all(&temp_dir).await {
            // The archive is still tracked, close() removes it
            return Err(ProvisionError::Io(e).into());
        }
        let local_archive = Downloader::new(temp_dir)
            .download(session, &remote_archive, reporter)
            .await?;

        let files = Extractor::new()
            .extract(
                session,
                &local_archive,
                &self.settings.local_target_dir(),
                reporter,
            )
            .await?;
        Ok((remote_archive, files))
    }
}

fn fail(callback: &dyn ProgressCallback, err: ProvisionError) -> PipelineOutcome {
    callback.on_error(&err.to_string());
    PipelineOutcome::Failed(err)
}
