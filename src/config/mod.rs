//! Configuration Management Module
//!
//! JSON config file with SSH target and pipeline settings.

pub mod storage;
pub mod types;

pub use storage::{ConfigStorage, StorageError};
pub use types::{PipelineSettings, ProvisionConfig, CONFIG_VERSION};
