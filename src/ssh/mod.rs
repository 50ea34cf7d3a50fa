//! SSH module - connections, host key checks and the command/SFTP transport
//!
//! This module provides the core SSH functionality using the russh library.
//!
//! # Features
//! - Password and private key authentication
//! - Host key verification via ~/.ssh/known_hosts
//! - Single-owner handle task (see `handle_owner`)
//! - Remote command execution with streaming output, timeout and kill-on-cancel

mod client;
mod config;
mod error;
mod handle_owner;
mod transport;

pub use client::{ClientHandler, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use transport::{RusshTransport, SshConnector};
