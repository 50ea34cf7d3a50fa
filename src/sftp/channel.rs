//! SFTP-backed [`TransferChannel`]

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{Abort, ProvisionError, StepResult};
use crate::session::{OperationControl, TransferChannel};
use crate::ssh::{HandleController, SshError};

/// Read/write chunk size
const CHUNK_SIZE: usize = 64 * 1024;

/// SFTP I/O timeout so a dead connection cannot stall a transfer forever
const SFTP_IO_TIMEOUT: Duration = Duration::from_secs(300);

/// One SFTP subsystem channel on an existing connection
pub struct SftpChannel {
    sftp: RusshSftpSession,
}

impl SftpChannel {
    /// Open the SFTP subsystem on a fresh session channel.
    pub async fn open(controller: &HandleController) -> Result<Self, SshError> {
        let channel = controller.open_session_channel().await?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::SftpError(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::SftpError(e.to_string()))?;

        debug!("SFTP subsystem opened");
        Ok(Self { sftp })
    }
}

fn transfer_error(remote: &str, local: &Path, message: impl ToString) -> ProvisionError {
    ProvisionError::Transfer {
        remote: remote.to_string(),
        local: local.to_path_buf(),
        message: message.to_string(),
    }
}

#[async_trait]
impl TransferChannel for SftpChannel {
    async fn size(&self, remote: &str) -> Result<u64, ProvisionError> {
        let metadata = self
            .sftp
            .metadata(remote)
            .await
            .map_err(|e| transfer_error(remote, Path::new(""), e))?;
        Ok(metadata.size.unwrap_or(0))
    }

    async fn get(&self, remote: &str, local: &Path, control: &OperationControl) -> StepResult<u64> {
        let mut remote_file = self
            .sftp
            .open(remote)
            .await
            .map_err(|e| transfer_error(remote, local, e))?;
        let mut local_file = tokio::fs::File::create(local).await?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut transferred: u64 = 0;

        loop {
            if control.is_cancelled() {
                info!("Download of {} cancelled at {} bytes", remote, transferred);
                return Err(Abort::Cancelled);
            }

            let bytes_read =
                match tokio::time::timeout(SFTP_IO_TIMEOUT, remote_file.read(&mut buffer)).await {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(transfer_error(remote, local, e).into()),
                    Err(_) => {
                        warn!(
                            "SFTP read timeout after {:?} at {} bytes",
                            SFTP_IO_TIMEOUT, transferred
                        );
                        return Err(transfer_error(
                            remote,
                            local,
                            format!("read timeout after {:?}", SFTP_IO_TIMEOUT),
                        )
                        .into());
                    }
                };

            if bytes_read == 0 {
                break;
            }

            local_file.write_all(&buffer[..bytes_read]).await?;
            transferred += bytes_read as u64;
        }

        local_file.flush().await?;
        Ok(transferred)
    }

    async fn put(&self, local: &Path, remote: &str, control: &OperationControl) -> StepResult<u64> {
        let mut local_file = tokio::fs::File::open(local).await?;
        let mut remote_file = self
            .sftp
            .create(remote)
            .await
            .map_err(|e| transfer_error(remote, local, e))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut transferred: u64 = 0;

        loop {
            if control.is_cancelled() {
                info!("Upload to {} cancelled at {} bytes", remote, transferred);
                return Err(Abort::Cancelled);
            }

            let bytes_read = local_file.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }

            match tokio::time::timeout(
                SFTP_IO_TIMEOUT,
                AsyncWriteExt::write_all(&mut remote_file, &buffer[..bytes_read]),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(transfer_error(remote, local, e).into()),
                Err(_) => {
                    return Err(transfer_error(
                        remote,
                        local,
                        format!("write timeout after {:?}", SFTP_IO_TIMEOUT),
                    )
                    .into())
                }
            }
            transferred += bytes_read as u64;
        }

        remote_file
            .shutdown()
            .await
            .map_err(|e| transfer_error(remote, local, e))?;
        Ok(transferred)
    }

    async fn remove(&self, remote: &str) -> Result<(), ProvisionError> {
        self.sftp
            .remove_file(remote)
            .await
            .map_err(|e| transfer_error(remote, Path::new(""), e))
    }
}
