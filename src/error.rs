//! Provisioning error types
//!
//! `ProvisionError` covers every failure a pipeline step can surface.
//! Cancellation is not one of them: steps return [`Abort`],
//! which keeps a user-initiated stop in its own variant.

use std::path::PathBuf;

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Remote command failed ({reason}): {command}")]
    CommandFailed {
        command: String,
        exit_code: Option<u32>,
        reason: String,
        output: String,
    },

    #[error("Remote command timed out after {secs}s: {command}")]
    CommandTimeout { command: String, secs: u64 },

    #[error("Transfer failed ({remote} -> {}): {message}", local.display())]
    Transfer {
        remote: String,
        local: PathBuf,
        message: String,
    },

    #[error("Extraction failed at {}: {message}", path.display())]
    Extraction { path: PathBuf, message: String },

    #[error(
        "Failed to copy {} to {} after {attempts} attempts: {last_error}",
        source_path.display(),
        destination_path.display()
    )]
    LockedFile {
        source_path: PathBuf,
        destination_path: PathBuf,
        attempts: usize,
        last_error: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SshError> for ProvisionError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(msg) | SshError::KeyError(msg) => {
                ProvisionError::Auth(msg)
            }
            SshError::ConnectionFailed(msg) | SshError::Timeout(msg) => {
                ProvisionError::Connect(msg)
            }
            other => ProvisionError::Connect(other.to_string()),
        }
    }
}

/// Why a pipeline step stopped early.
#[derive(Debug)]
pub enum Abort {
    /// The user (or a graceful shutdown) asked the operation to stop.
    Cancelled,
    /// The step failed.
    Failed(ProvisionError),
}

impl Abort {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Abort::Cancelled)
    }
}

impl std::fmt::Display for Abort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Abort::Cancelled => write!(f, "Operation cancelled"),
            Abort::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl From<ProvisionError> for Abort {
    fn from(err: ProvisionError) -> Self {
        Abort::Failed(err)
    }
}

impl From<std::io::Error> for Abort {
    fn from(err: std::io::Error) -> Self {
        Abort::Failed(ProvisionError::Io(err))
    }
}

impl From<SshError> for Abort {
    fn from(err: SshError) -> Self {
        Abort::Failed(err.into())
    }
}

/// Result type for pipeline steps
pub type StepResult<T> = Result<T, Abort>;
