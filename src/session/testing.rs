//! In-memory remote host for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use super::control::OperationControl;
use super::transport::{CommandResult, Connector, LineSink, RemoteTransport, TransferChannel};
use crate::error::{Abort, ProvisionError, StepResult};

type Handler = Box<dyn Fn(&FakeTransport, &str) -> Option<CommandResult> + Send + Sync>;

/// Simulated remote host.
///
/// Commands go to the handler first; `rm -f` and the login-shell `echo` used
/// for env lookups are built in. Anything else succeeds with no output.
pub struct FakeTransport {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    env: Mutex<HashMap<String, String>>,
    handler: Option<Handler>,
    commands: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    fail_transfers: Arc<AtomicBool>,
    stall_on: Mutex<Option<String>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub fn with_env(name: &str, value: &str) -> Arc<Self> {
        let fake = Self::build(None);
        fake.env.lock().insert(name.to_string(), value.to_string());
        Arc::new(fake)
    }

    pub fn with_handler<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&FakeTransport, &str) -> Option<CommandResult> + Send + Sync + 'static,
    {
        Arc::new(Self::build(Some(Box::new(handler))))
    }

    fn build(handler: Option<Handler>) -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            env: Mutex::new(HashMap::new()),
            handler,
            commands: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            chunk_size: 64 * 1024,
            chunk_delay: None,
            fail_transfers: Arc::new(AtomicBool::new(false)),
            stall_on: Mutex::new(None),
        }
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.env.lock().insert(name.to_string(), value.to_string());
    }

    /// Slow down `get` so observers get a chance to sample.
    pub fn with_transfer_pacing(mut self: Arc<Self>, chunk_size: usize, delay: Duration) -> Arc<Self> {
        let fake = Arc::get_mut(&mut self).expect("pacing must be set before sharing");
        fake.chunk_size = chunk_size;
        fake.chunk_delay = Some(delay);
        self
    }

    pub fn fail_transfers(&self) {
        self.fail_transfers.store(true, Ordering::SeqCst);
    }

    /// Commands containing `needle` still take effect but never answer, so
    /// they run into their timeout.
    pub fn stall_commands_containing(&self, needle: &str) {
        *self.stall_on.lock() = Some(needle.to_string());
    }

    pub fn put_remote_file(&self, path: &str, contents: Vec<u8>) {
        self.files.lock().insert(path.to_string(), contents);
    }

    pub fn has_remote_file(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn remote_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.files.lock().keys().cloned().collect();
        files.sort();
        files
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect_count() > 0
    }

    fn builtin(&self, command: &str) -> CommandResult {
        if let Some(path) = command.strip_prefix("rm -f ") {
            self.files.lock().remove(unquote(path));
            return CommandResult::new(0, "");
        }
        if command.starts_with("sh -lc ") {
            if let Some(name) = command
                .split("${")
                .nth(1)
                .and_then(|rest| rest.split('}').next())
            {
                let value = self.env.lock().get(name).cloned().unwrap_or_default();
                return CommandResult::new(0, format!("{}\n", value));
            }
        }
        CommandResult::new(0, "")
    }
}

/// Strip one layer of single quotes.
pub fn unquote(value: &str) -> &str {
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value)
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        lines: Option<LineSink<'_>>,
        control: Option<&OperationControl>,
    ) -> StepResult<CommandResult> {
        if self.is_disconnected() {
            return Err(ProvisionError::Connect("disconnected".to_string()).into());
        }
        self.commands.lock().push(command.to_string());

        let result = self
            .handler
            .as_ref()
            .and_then(|handler| handler(self, command))
            .unwrap_or_else(|| self.builtin(command));

        let stalls = self
            .stall_on
            .lock()
            .as_deref()
            .is_some_and(|needle| command.contains(needle));
        if stalls {
            tokio::time::sleep(timeout).await;
            return Err(ProvisionError::CommandTimeout {
                command: command.to_string(),
                secs: timeout.as_secs(),
            }
            .into());
        }

        for line in result.output.lines() {
            if let Some(sink) = lines {
                sink(line);
            }
            if control.is_some_and(|c| c.is_cancelled()) {
                return Err(Abort::Cancelled);
            }
            tokio::task::yield_now().await;
        }
        Ok(result)
    }

    async fn open_transfer_channel(&self) -> Result<Box<dyn TransferChannel>, ProvisionError> {
        Ok(Box::new(FakeChannel {
            files: self.files.clone(),
            chunk_size: self.chunk_size,
            chunk_delay: self.chunk_delay,
            fail: self.fail_transfers.clone(),
        }))
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeChannel {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    fail: Arc<AtomicBool>,
}

impl FakeChannel {
    fn read(&self, remote: &str, local: &Path) -> Result<Vec<u8>, ProvisionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProvisionError::Transfer {
                remote: remote.to_string(),
                local: local.to_path_buf(),
                message: "connection reset".to_string(),
            });
        }
        self.files
            .lock()
            .get(remote)
            .cloned()
            .ok_or_else(|| ProvisionError::Transfer {
                remote: remote.to_string(),
                local: local.to_path_buf(),
                message: "no such file".to_string(),
            })
    }
}

#[async_trait]
impl TransferChannel for FakeChannel {
    async fn size(&self, remote: &str) -> Result<u64, ProvisionError> {
        self.files
            .lock()
            .get(remote)
            .map(|data| data.len() as u64)
            .ok_or_else(|| ProvisionError::Transfer {
                remote: remote.to_string(),
                local: Default::default(),
                message: "no such file".to_string(),
            })
    }

    async fn get(&self, remote: &str, local: &Path, control: &OperationControl) -> StepResult<u64> {
        let data = self.read(remote, local)?;
        let mut file = tokio::fs::File::create(local).await?;
        for chunk in data.chunks(self.chunk_size.max(1)) {
            if control.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            file.write_all(chunk).await?;
            file.flush().await?;
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(data.len() as u64)
    }

    async fn put(&self, local: &Path, remote: &str, control: &OperationControl) -> StepResult<u64> {
        if control.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        let data = tokio::fs::read(local).await?;
        let len = data.len() as u64;
        self.files.lock().insert(remote.to_string(), data);
        Ok(len)
    }

    async fn remove(&self, remote: &str) -> Result<(), ProvisionError> {
        self.files.lock().remove(remote);
        Ok(())
    }
}

/// Connector handing out one shared fake.
pub struct FakeConnector {
    pub transport: Arc<FakeTransport>,
    pub refuse: bool,
}

impl FakeConnector {
    pub fn new(transport: Arc<FakeTransport>) -> Self {
        Self {
            transport,
            refuse: false,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _session_id: &str) -> Result<Arc<dyn RemoteTransport>, ProvisionError> {
        if self.refuse {
            return Err(ProvisionError::Auth("permission denied".to_string()));
        }
        Ok(self.transport.clone())
    }

    fn target(&self) -> String {
        "tester@fake-host:22".to_string()
    }
}

/// Pieces of an archive command issued by the archiver.
pub struct ArchiveParts {
    pub dir: String,
    pub archive: String,
    pub marker: String,
}

/// Split `cd DIR && zip -r ARCHIVE ... && chmod ... && echo MARKER`.
pub fn parse_archive_command(command: &str) -> Option<ArchiveParts> {
    let parts: Vec<&str> = command.split(" && ").collect();
    if parts.len() != 4 {
        return None;
    }
    let dir = unquote(parts[0].strip_prefix("cd ")?);
    let archive = parts[1].strip_prefix("zip -r ")?.split(" . ").next()?;
    let marker = unquote(parts[3].strip_prefix("echo ")?);
    Some(ArchiveParts {
        dir: dir.to_string(),
        archive: unquote(archive).to_string(),
        marker: marker.to_string(),
    })
}

/// In-memory zip. Names ending in `/` become directory entries.
pub fn zip_fixture(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let with_modes: Vec<(&str, &[u8], u32)> = entries
        .iter()
        .map(|(name, data)| {
            let mode = if name.ends_with('/') { 0o755 } else { 0o644 };
            (*name, *data, mode)
        })
        .collect();
    zip_fixture_with_modes(&with_modes)
}

/// Like [`zip_fixture`] with an explicit unix mode per entry.
pub fn zip_fixture_with_modes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data, mode) in entries {
        let options = SimpleFileOptions::default().unix_permissions(*mode);
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}
