//! oxidefetch - provision a local workspace from a remote installation

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, warn};

use oxidefetch::config::{ConfigStorage, ProvisionConfig};
use oxidefetch::session::SessionRegistry;
use oxidefetch::sftp::RetryingCopier;
use oxidefetch::ssh::SshConnector;
use oxidefetch::{Abort, PipelineOutcome, ProgressCallback, ProvisionPipeline, Reporter};

// Many small allocations while streaming command output and copying chunks
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "oxidefetch")]
#[command(author, version, about = "Archive, download and extract a remote project tree")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the provisioning pipeline
    Run {
        /// Config file (default: ~/.oxidefetch/config.json)
        #[arg(short, long, env = "OXIDEFETCH_CONFIG")]
        config: Option<PathBuf>,

        /// Parent of the local target directory, overrides the config
        #[arg(long)]
        extract_dir: Option<PathBuf>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Copy local files or trees into a directory, retrying locked targets
    Stage {
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Destination directory
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Write a default config file
    InitConfig {
        #[arg(short, long, env = "OXIDEFETCH_CONFIG")]
        config: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Terminal progress bar driven by pipeline callbacks.
struct ConsoleProgress {
    bar: ProgressBar,
    cancelled: AtomicBool,
}

impl ConsoleProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos:>3}% {wide_msg}",
        ) {
            bar.set_style(style.progress_chars("━━╾─"));
        }
        Arc::new(Self {
            bar,
            cancelled: AtomicBool::new(false),
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl ProgressCallback for ConsoleProgress {
    fn on_progress(&self, percent: u8, message: &str) {
        self.bar.set_position(percent as u64);
        self.bar.set_message(message.to_string());
    }

    fn on_complete(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    fn on_error(&self, message: &str) {
        self.bar.abandon_with_message(format!("Failed: {}", message));
    }

    fn on_cancelled(&self, message: &str) {
        self.bar.abandon_with_message(message.to_string());
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

fn storage_for(path: Option<PathBuf>) -> Result<ConfigStorage, String> {
    match path {
        Some(path) => Ok(ConfigStorage::with_path(path)),
        None => ConfigStorage::new().map_err(|e| e.to_string()),
    }
}

async fn load_config(path: Option<PathBuf>) -> Result<ProvisionConfig, String> {
    let storage = storage_for(path)?;
    if !storage.exists().await {
        return Err(format!(
            "no config at {} (run `oxidefetch init-config` first)",
            storage.path().display()
        ));
    }
    let config = storage.load().await.map_err(|e| e.to_string())?;
    config.validate()?;
    Ok(config)
}

async fn run(config: Option<PathBuf>, extract_dir: Option<PathBuf>, json: bool) -> ExitCode {
    let mut config = match load_config(config).await {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = extract_dir {
        config.pipeline.local_extract_dir = dir;
    }

    let grace = config.pipeline.shutdown_grace();
    let registry = Arc::new(SessionRegistry::new());
    let pipeline = Arc::new(ProvisionPipeline::new(
        config.pipeline,
        Arc::new(SshConnector::new(config.ssh)),
        registry.clone(),
    ));

    let progress = ConsoleProgress::new();
    let handle = pipeline.spawn(progress.clone());

    // First Ctrl-C drains gracefully, a second one forces cleanup
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, cancelling (Ctrl-C again to force)");
        tokio::select! {
            _ = registry.graceful_cleanup_all(grace) => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Forcing cleanup");
                registry.force_cleanup_all().await;
            }
        }
    });

    let outcome = handle.await;
    signals.abort();

    match outcome {
        Ok(PipelineOutcome::Completed(report)) => {
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(text) => println!("{}", text),
                    Err(e) => error!("Could not serialize report: {}", e),
                }
            } else {
                println!(
                    "{} files in {} ({:.1}s)",
                    report.files,
                    report.destination.display(),
                    report.elapsed.as_secs_f64()
                );
            }
            ExitCode::SUCCESS
        }
        Ok(PipelineOutcome::Cancelled) => ExitCode::from(130),
        Ok(PipelineOutcome::Failed(e)) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Pipeline task failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn stage(sources: Vec<PathBuf>, dest: PathBuf) -> ExitCode {
    let progress = ConsoleProgress::new();
    let reporter = Reporter::standalone(progress.clone());

    let interrupt = progress.clone();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = RetryingCopier::default()
        .stage_files(&sources, &dest, &reporter)
        .await;
    signals.abort();

    match result {
        Ok(report) => {
            progress.on_complete(&format!(
                "Staged {} files ({} bytes)",
                report.files, report.bytes
            ));
            ExitCode::SUCCESS
        }
        Err(Abort::Cancelled) => {
            progress.on_cancelled("Staging cancelled");
            ExitCode::from(130)
        }
        Err(Abort::Failed(e)) => {
            progress.on_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

async fn init_config(path: Option<PathBuf>, force: bool) -> ExitCode {
    let storage = match storage_for(path) {
        Ok(storage) => storage,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if storage.exists().await && !force {
        error!(
            "{} already exists (use --force to overwrite)",
            storage.path().display()
        );
        return ExitCode::FAILURE;
    }
    match storage.save(&ProvisionConfig::default()).await {
        Ok(()) => {
            println!("Wrote {}", storage.path().display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Could not write config: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    oxidefetch::init_logging(if cli.verbose { "debug" } else { "info" });

    match cli.command {
        Commands::Run {
            config,
            extract_dir,
            json,
        } => run(config, extract_dir, json).await,
        Commands::Stage { sources, dest } => stage(sources, dest).await,
        Commands::InitConfig { config, force } => init_config(config, force).await,
    }
}
