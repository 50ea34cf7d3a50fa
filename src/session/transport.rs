//! Transport seam between a [`Session`](super::Session) and the wire.
//!
//! The russh implementation lives in `crate::ssh::transport`; tests plug in a
//! simulated remote host.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::control::OperationControl;
use crate::error::{ProvisionError, StepResult};

/// Output of a finished remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// `None` when the server closed the channel without an exit status
    pub exit_code: Option<u32>,
    /// stdout and stderr, interleaved in arrival order, one line per `\n`
    pub output: String,
}

impl CommandResult {
    pub fn new(exit_code: u32, output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last non-empty output line, trimmed.
    pub fn last_line(&self) -> Option<&str> {
        self.output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
    }
}

/// Receives each output line while a command is still running.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Command execution and file transfer against one remote host.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run `command`, streaming lines to `lines`.
    ///
    /// With a `control`, cancellation is polled while waiting; on cancel the
    /// remote process is signalled and `Abort::Cancelled` is returned.
    /// Exceeding `timeout` yields `ProvisionError::CommandTimeout`.
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        lines: Option<LineSink<'_>>,
        control: Option<&OperationControl>,
    ) -> StepResult<CommandResult>;

    async fn open_transfer_channel(&self) -> Result<Box<dyn TransferChannel>, ProvisionError>;

    /// Release the connection. Must not block indefinitely on a dead peer.
    async fn disconnect(&self);
}

/// get/put primitives against the remote filesystem.
#[async_trait]
pub trait TransferChannel: Send + Sync {
    /// Size of a remote file in bytes
    async fn size(&self, remote: &str) -> Result<u64, ProvisionError>;

    /// Copy `remote` to `local`, checking `control` between chunks.
    async fn get(&self, remote: &str, local: &Path, control: &OperationControl) -> StepResult<u64>;

    /// Copy `local` to `remote`, checking `control` between chunks.
    async fn put(&self, local: &Path, remote: &str, control: &OperationControl) -> StepResult<u64>;

    async fn remove(&self, remote: &str) -> Result<(), ProvisionError>;
}

/// Opens authenticated transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<Arc<dyn RemoteTransport>, ProvisionError>;

    /// Human-readable target, e.g. `deploy@nms01:22`
    fn target(&self) -> String;
}
