//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a [`HandleController`], which sends commands over an mpsc channel.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Deadlocks from holding locks across `.await`
//! - Protocol violations from concurrent Handle access
//!
//! # Usage
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, session_id);
//! let channel = controller.open_session_channel().await?;
//! ```

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (exec / sftp subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the sender). Every clone has full control of the
/// connection, including disconnecting it.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Create a controller around an existing command sender.
    ///
    /// Primarily for tests. In production, use [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        info!("Handle owner task started for session {}", session_id);

        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped here and the server closes it
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }
                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for session {}", session_id);
                    break;
                }
                None => {
                    info!("All controllers dropped for session {}", session_id);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            debug!("disconnect for session {} failed: {}", session_id, e);
        }
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
