//! One provisioning session: a transport plus the files created through it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::control::OperationControl;
use super::registry::SessionRegistry;
use super::transport::{CommandResult, Connector, LineSink, RemoteTransport, TransferChannel};
use crate::error::{Abort, ProvisionError, StepResult};
use crate::sftp::path_utils::{is_env_var_name, shell_quote};

/// Upper bound for each cleanup command issued by [`Session::close`].
const CLEANUP_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound for tearing down the transport.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An authenticated remote session.
///
/// Every temp file a step creates is tracked here until it is deleted, so
/// [`close`](Self::close) can sweep up whatever an aborted run left behind.
pub struct Session {
    id: String,
    purpose: String,
    target: String,
    transport: Arc<dyn RemoteTransport>,
    control: Arc<OperationControl>,
    remote_files: Mutex<BTreeSet<String>>,
    local_files: Mutex<BTreeSet<PathBuf>>,
    disconnected: AtomicBool,
}

impl Session {
    /// Connect, authenticate and register a new session.
    pub async fn open(
        connector: &dyn Connector,
        purpose: &str,
        registry: &SessionRegistry,
    ) -> Result<Arc<Session>, ProvisionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let target = connector.target();

        info!("Opening session {} ({}) to {}", id, purpose, target);
        let transport = connector.connect(&id).await?;

        let session = Arc::new(Self::with_transport(id, purpose, target, transport));
        registry.register(session.clone());
        Ok(session)
    }

    /// Wrap an already-connected transport. Does not register.
    pub fn with_transport(
        id: impl Into<String>,
        purpose: impl Into<String>,
        target: impl Into<String>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        Self {
            id: id.into(),
            purpose: purpose.into(),
            target: target.into(),
            transport,
            control: Arc::new(OperationControl::new()),
            remote_files: Mutex::new(BTreeSet::new()),
            local_files: Mutex::new(BTreeSet::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn control(&self) -> &Arc<OperationControl> {
        &self.control
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Run a remote command under this session's cancellation control.
    pub async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
        lines: Option<LineSink<'_>>,
    ) -> StepResult<CommandResult> {
        if self.control.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        debug!("[{}] exec: {}", self.id, command);
        self.transport
            .exec(command, timeout, lines, Some(&self.control))
            .await
    }

    /// Run a remote command that must complete even after cancellation.
    pub async fn run_command_ignoring_cancellation(
        &self,
        command: &str,
        timeout: Duration,
    ) -> StepResult<CommandResult> {
        debug!("[{}] exec (uncancellable): {}", self.id, command);
        self.transport.exec(command, timeout, None, None).await
    }

    /// Read an environment variable through a login shell on the remote host.
    ///
    /// Empty values, and values that merely echo the variable's own name back
    /// (`NAME`, `$NAME`, `${NAME}`, `%NAME%`), count as unset.
    pub async fn resolve_env_var(&self, name: &str, timeout: Duration) -> StepResult<String> {
        if !is_env_var_name(name) {
            return Err(ProvisionError::Precondition(format!(
                "invalid environment variable name: {:?}",
                name
            ))
            .into());
        }

        let command = format!("sh -lc {}", shell_quote(&format!("echo \"${{{}}}\"", name)));
        let result = self.run_command(&command, timeout, None).await?;
        if !result.success() {
            return Err(ProvisionError::Precondition(format!(
                "could not read {} on {} (exit code {:?})",
                name, self.target, result.exit_code
            ))
            .into());
        }

        let value = result.last_line().unwrap_or_default();
        if is_unset_echo(name, value) {
            return Err(ProvisionError::Precondition(format!(
                "{} is not set on {}",
                name, self.target
            ))
            .into());
        }

        Ok(value.to_string())
    }

    pub async fn open_transfer_channel(&self) -> Result<Box<dyn TransferChannel>, ProvisionError> {
        self.transport.open_transfer_channel().await
    }

    pub fn track_remote_file(&self, path: &str) {
        if self.is_disconnected() {
            warn!("[{}] tracking {} on a closed session", self.id, path);
        }
        self.remote_files.lock().insert(path.to_string());
    }

    pub fn untrack_remote_file(&self, path: &str) {
        self.remote_files.lock().remove(path);
    }

    pub fn track_local_file(&self, path: &Path) {
        self.local_files.lock().insert(path.to_path_buf());
    }

    pub fn untrack_local_file(&self, path: &Path) {
        self.local_files.lock().remove(path);
    }

    pub fn tracked_remote_files(&self) -> Vec<String> {
        self.remote_files.lock().iter().cloned().collect()
    }

    pub fn tracked_local_files(&self) -> Vec<PathBuf> {
        self.local_files.lock().iter().cloned().collect()
    }

    /// Delete a remote file with `rm -f`, regardless of cancellation, and
    /// stop tracking it.
    pub async fn delete_remote_file(&self, path: &str) -> StepResult<()> {
        let command = format!("rm -f {}", shell_quote(path));
        let result = self
            .run_command_ignoring_cancellation(&command, CLEANUP_COMMAND_TIMEOUT)
            .await?;
        if !result.success() {
            return Err(ProvisionError::CommandFailed {
                command,
                exit_code: result.exit_code,
                reason: "remote delete failed".to_string(),
                output: result.output,
            }
            .into());
        }
        self.untrack_remote_file(path);
        Ok(())
    }

    /// Best-effort cleanup and disconnect.
    ///
    /// Both tracking sets are empty afterwards whatever the individual deletes
    /// did. Safe to call repeatedly; later calls only sweep files tracked since.
    pub async fn close(&self) {
        let local: Vec<PathBuf> = std::mem::take(&mut *self.local_files.lock())
            .into_iter()
            .collect();
        for path in local {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("[{}] removed local temp {}", self.id, path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "[{}] failed to remove local temp {}: {}",
                    self.id,
                    path.display(),
                    e
                ),
            }
        }

        let remote: Vec<String> = std::mem::take(&mut *self.remote_files.lock())
            .into_iter()
            .collect();
        for path in remote {
            if self.is_disconnected() {
                warn!("[{}] cannot remove {}: already disconnected", self.id, path);
                continue;
            }
            let command = format!("rm -f {}", shell_quote(&path));
            match self
                .run_command_ignoring_cancellation(&command, CLEANUP_COMMAND_TIMEOUT)
                .await
            {
                Ok(result) if result.success() => {
                    debug!("[{}] removed remote temp {}", self.id, path)
                }
                Ok(result) => warn!(
                    "[{}] rm -f {} exited with {:?}",
                    self.id, path, result.exit_code
                ),
                Err(e) => warn!("[{}] failed to remove remote temp {}: {}", self.id, path, e),
            }
        }

        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if tokio::time::timeout(DISCONNECT_TIMEOUT, self.transport.disconnect())
            .await
            .is_err()
        {
            warn!("[{}] disconnect timed out", self.id);
        }
        info!("Session {} closed", self.id);
    }
}

fn is_unset_echo(name: &str, value: &str) -> bool {
    value.is_empty()
        || value == name
        || value == format!("${}", name)
        || value == format!("${{{}}}", name)
        || value == format!("%{}%", name)
}
