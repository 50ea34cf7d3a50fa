//! Session Management Module
//!
//! Provides:
//! - [`Session`]: a connected remote host plus the temp files created on it
//! - [`SessionRegistry`]: thread-safe bookkeeping via DashMap, with graceful
//!   and forced shutdown paths
//! - [`OperationControl`]: cooperative cancellation shared by a session's steps
//! - The [`RemoteTransport`] / [`TransferChannel`] seam the SSH layer implements

mod control;
mod registry;
#[allow(clippy::module_inception)]
mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod types;

pub use control::OperationControl;
pub use registry::SessionRegistry;
pub use session::Session;
pub use transport::{CommandResult, Connector, LineSink, RemoteTransport, TransferChannel};
pub use types::SessionInfo;
