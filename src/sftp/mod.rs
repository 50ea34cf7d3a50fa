//! File transfer module
//!
//! Provides the SFTP transfer channel, the archive downloader with its
//! polling observer, and the retrying local copier.

pub mod channel;
pub mod download;
pub mod path_utils;
pub mod progress;
pub mod retry;

pub use channel::SftpChannel;
pub use download::Downloader;
pub use progress::{TransferProgress, TransferStatus};
pub use retry::{RetryConfig, RetryingCopier, StageReport};
