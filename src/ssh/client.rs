//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;

/// SSH Client
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect and authenticate, returning the raw handle.
    ///
    /// Callers hand the handle to [`spawn_handle_owner_task`](super::spawn_handle_owner_task)
    /// right away; nothing else should hold it.
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.strict_host_key_checking,
        );

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| match e {
            SshError::HostKeyRejected(msg) => SshError::HostKeyRejected(msg),
            other => SshError::ConnectionFailed(other.to_string()),
        })?;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key_path = expand_home(key_path);
                let key = russh::keys::load_secret_key(&key_path, passphrase.as_deref())
                    .map_err(|e| {
                        SshError::KeyError(format!("{}: {}", key_path.display(), e))
                    })?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(format!(
                "Authentication rejected by server for user {}",
                self.config.username
            )));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);

        Ok(handle)
    }
}

/// Expand a leading `~/` against the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Client handler for russh callbacks
///
/// Verifies the server key against `~/.ssh/known_hosts`.
pub struct ClientHandler {
    host: String,
    port: u16,
    /// - true: reject unknown keys
    /// - false: learn unknown keys (changed keys are always rejected)
    strict: bool,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool) -> Self {
        Self { host, port, strict }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) => {
                if self.strict {
                    warn!(
                        "Unknown host key for {}:{}. Strict mode enabled, rejecting.",
                        self.host, self.port
                    );
                    return Err(SshError::HostKeyRejected(format!(
                        "unknown host {}:{}; add it to known_hosts or disable strict mode",
                        self.host, self.port
                    )));
                }

                info!(
                    "New host {}:{}, adding to known_hosts",
                    self.host, self.port
                );
                if let Err(e) =
                    russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, server_public_key)
                {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!(
                    "HOST KEY CHANGED for {}:{} (known_hosts line {})",
                    self.host, self.port, line
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} differs from known_hosts line {}",
                    self.host, self.port, line
                )))
            }
            Err(e) => {
                // Unreadable known_hosts is treated like an unknown host.
                warn!("known_hosts lookup failed for {}: {}", self.host, e);
                Ok(!self.strict)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/key"), PathBuf::from("/etc/key"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.ssh/id_rsa"), home.join(".ssh/id_rsa"));
        }
    }
}
