//! russh implementation of the session transport seam

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::client::SshClient;
use super::config::SshConfig;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use crate::error::{Abort, ProvisionError, StepResult};
use crate::session::{
    CommandResult, Connector, LineSink, OperationControl, RemoteTransport, TransferChannel,
};
use crate::sftp::SftpChannel;

/// How often a running command checks for cancellation
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Commands and SFTP over one SSH connection
pub struct RusshTransport {
    controller: HandleController,
}

impl RusshTransport {
    pub fn new(controller: HandleController) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl RemoteTransport for RusshTransport {
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        lines: Option<LineSink<'_>>,
        control: Option<&OperationControl>,
    ) -> StepResult<CommandResult> {
        let mut channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| command_failed(command, format!("exec request failed: {}", e)))?;

        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stdout = LineBuffer::default();
        let mut stderr = LineBuffer::default();
        let mut output = String::new();
        let mut exit_code: Option<u32> = None;

        loop {
            tokio::select! {
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => stdout.push(&data, &mut output, lines),
                    // ext=1 is stderr
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stderr.push(&data, &mut output, lines)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                    // Exit status may still follow EOF
                    Some(ChannelMsg::Eof) => {}
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
                _ = ticker.tick() => {
                    if control.is_some_and(|c| c.is_cancelled()) {
                        info!("Cancelling remote command: {}", command);
                        terminate(&channel).await;
                        return Err(Abort::Cancelled);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Remote command timed out after {:?}: {}", timeout, command);
                    terminate(&channel).await;
                    return Err(ProvisionError::CommandTimeout {
                        command: command.to_string(),
                        secs: timeout.as_secs(),
                    }
                    .into());
                }
            }
        }

        stdout.finish(&mut output, lines);
        stderr.finish(&mut output, lines);
        debug!("exit={:?} output_len={}: {}", exit_code, output.len(), command);

        Ok(CommandResult { exit_code, output })
    }

    async fn open_transfer_channel(&self) -> Result<Box<dyn TransferChannel>, ProvisionError> {
        let channel = SftpChannel::open(&self.controller).await?;
        Ok(Box::new(channel))
    }

    async fn disconnect(&self) {
        self.controller.disconnect().await;
    }
}

/// Kill the remote process and close the channel.
async fn terminate(channel: &Channel<Msg>) {
    if let Err(e) = channel.signal(Sig::KILL).await {
        debug!("signal KILL failed: {}", e);
    }
    if let Err(e) = channel.close().await {
        debug!("channel close failed: {}", e);
    }
}

fn command_failed(command: &str, reason: String) -> ProvisionError {
    ProvisionError::CommandFailed {
        command: command.to_string(),
        exit_code: None,
        reason,
        output: String::new(),
    }
}

/// Splits a byte stream into lines, tolerating chunk boundaries mid-line.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8], output: &mut String, sink: Option<LineSink<'_>>) {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            emit(&line[..line.len() - 1], output, sink);
        }
    }

    fn finish(&mut self, output: &mut String, sink: Option<LineSink<'_>>) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            emit(&rest, output, sink);
        }
    }
}

fn emit(raw: &[u8], output: &mut String, sink: Option<LineSink<'_>>) {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches('\r');
    output.push_str(line);
    output.push('\n');
    if let Some(sink) = sink {
        sink(line);
    }
}

/// Opens [`RusshTransport`]s from an [`SshConfig`]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, session_id: &str) -> Result<Arc<dyn RemoteTransport>, ProvisionError> {
        let handle = SshClient::new(self.config.clone()).connect().await?;
        let controller = spawn_handle_owner_task(handle, session_id.to_string());
        Ok(Arc::new(RusshTransport::new(controller)))
    }

    fn target(&self) -> String {
        format!(
            "{}@{}:{}",
            self.config.username, self.config.host, self.config.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_line_buffer_handles_split_chunks() {
        let seen = Mutex::new(Vec::<String>::new());
        let sink = |line: &str| seen.lock().push(line.to_string());
        let mut buffer = LineBuffer::default();
        let mut output = String::new();

        buffer.push(b"  adding: a.t", &mut output, Some(&sink));
        buffer.push(b"xt (stored 0%)\r\n  adding: b", &mut output, Some(&sink));
        buffer.push(b".txt\nARCHIVE_OK", &mut output, Some(&sink));
        buffer.finish(&mut output, Some(&sink));

        assert_eq!(
            *seen.lock(),
            vec![
                "  adding: a.txt (stored 0%)".to_string(),
                "  adding: b.txt".to_string(),
                "ARCHIVE_OK".to_string(),
            ]
        );
        assert_eq!(output.lines().count(), 3);
    }

    #[test]
    fn test_connector_target() {
        let connector = SshConnector::new(SshConfig {
            host: "nms01".into(),
            username: "deploy".into(),
            ..SshConfig::default()
        });
        assert_eq!(connector.target(), "deploy@nms01:22");
    }
}
