//! Archive Module
//!
//! Remote archive creation and local extraction.

pub mod extract;
pub mod matcher;
pub mod remote;

pub use extract::Extractor;
pub use matcher::{LineMatcher, RegexLineMatcher, ZipVerboseMatcher};
pub use remote::{archive_command, RemoteArchiver};
