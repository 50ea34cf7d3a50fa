//! OxideFetch - remote project provisioning over SSH
//!
//! Archives a directory on a remote host, downloads it with live progress,
//! extracts it into a local workspace and removes every temp file it created
//! along the way, whether the run completes, fails or is cancelled.

pub mod archive;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod session;
pub mod sftp;
pub mod ssh;

pub use error::{Abort, ProvisionError, StepResult};
pub use pipeline::{PipelineOutcome, ProvisionPipeline, ProvisionReport};
pub use progress::{ProgressCallback, Reporter, SilentProgress};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides `default_level`.
pub fn init_logging(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
