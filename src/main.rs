//! irondome - filesystem integrity monitor.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use irondome::config::{ConfigError, ConfigLoader, IrondomeConfig};
use irondome::display::{self, OutputMode};
use irondome::integrity::{self, BaselineStore, IntegrityGate};
use irondome::metrics::HostSampler;
use irondome::watch::{parse_event_list, WatchEngine, WatchError};

const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(
    name = "irondome",
    about = "Watch directory trees and alert when file contents drift from a hashed baseline",
    version
)]
struct Cli {
    /// Root directories to watch, comma-separated.
    #[arg(required = true, value_delimiter = ',')]
    paths: Vec<PathBuf>,

    /// Event kinds to report, comma-separated (default: all).
    #[arg(short, long, value_delimiter = ',')]
    events: Vec<String>,

    /// Rebuild the integrity baseline before watching.
    #[arg(long)]
    init: bool,

    /// Also write logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Baseline database location.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Disable host CPU and disk sampling.
    #[arg(long)]
    no_metrics: bool,

    /// Print events as JSON lines.
    #[arg(long)]
    json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Command-line flags take precedence over the config file.
    fn apply(&self, config: &mut IrondomeConfig) -> Result<(), ConfigError> {
        if !self.events.is_empty() {
            parse_event_list(&self.events)?;
            config.watch.events.clone_from(&self.events);
        }
        if let Some(database) = &self.database {
            config.integrity.database = Some(database.clone());
        }
        if let Some(file) = &self.log_file {
            config.log.file = Some(file.clone());
        }
        if self.no_metrics {
            config.metrics.enabled = false;
        }
        Ok(())
    }
}

fn init_tracing(verbosity: u8, log_file: Option<&Path>) -> std::io::Result<()> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn wait_for_shutdown(token: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = token.cancelled() => return,
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loader = cli
        .config
        .clone()
        .map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    let mut config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            display::print_error(&e.to_string());
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(e) = cli.apply(&mut config) {
        display::print_error(&e.to_string());
        return ExitCode::from(EXIT_CONFIG);
    }

    if let Err(e) = init_tracing(cli.verbose, config.log.file.as_deref()) {
        display::print_error(&format!("Failed to open log file: {e}"));
        return ExitCode::from(EXIT_CONFIG);
    }

    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match run(&cli, config, mode).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            display::print_error(&message);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: &Cli, config: IrondomeConfig, mode: OutputMode) -> Result<(), String> {
    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root, some paths may be unreadable");
    }

    let engine_config = config.watch.engine_config().map_err(|e| e.to_string())?;

    let database = config.integrity.database_path();
    let store = Arc::new(integrity::open_baseline(&database).map_err(|e| e.to_string())?);
    tracing::info!(path = %database.display(), "Opened baseline store");

    let gate = IntegrityGate::new(
        Arc::clone(&store) as Arc<dyn BaselineStore>,
        config.integrity.chunk_size,
    );
    let engine = WatchEngine::open(engine_config, gate).map_err(|e| e.to_string())?;
    let report = engine.add_roots(&cli.paths).map_err(|e| e.to_string())?;
    if mode == OutputMode::Human {
        display::print_watching(&report);
    } else {
        for failure in &report.failures {
            tracing::warn!(error = %failure, "Watch registration failed");
        }
    }

    let existing = store.count().map_err(|e| e.to_string())?;
    if cli.init || existing == 0 {
        let rebuilt = cli.init;
        let roots = report.roots.clone();
        let chunk_size = config.integrity.chunk_size;
        let scan_store = Arc::clone(&store);
        let baseline = tokio::task::spawn_blocking(move || {
            if rebuilt {
                integrity::rebuild(scan_store.as_ref(), &roots, chunk_size)
            } else {
                integrity::initialize(scan_store.as_ref(), &roots, chunk_size)
            }
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;
        tracing::info!(hashed = baseline.hashed, skipped = baseline.skipped, "Baseline ready");
        if mode == OutputMode::Human {
            display::print_baseline(&baseline, rebuilt);
        }
    }

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    let sampler = if config.metrics.enabled {
        match HostSampler::new(config.metrics.sampler_config()) {
            Ok(sampler) => Some(tokio::spawn(sampler.run(cancel.clone()))),
            Err(e) => {
                tracing::warn!(error = %e, "Host sampling disabled");
                None
            }
        }
    } else {
        None
    };

    let (handle, mut events) = engine.spawn(cancel.clone());
    while let Some(event) = events.recv().await {
        display::print_event(&event, mode);
    }

    let outcome: Result<(), WatchError> = handle.await.map_err(|e| e.to_string())?;
    cancel.cancel();
    if let Some(sampler) = sampler {
        if let Err(e) = sampler.await {
            tracing::warn!(error = %e, "Host sampler task failed");
        }
    }
    tracing::info!("Shut down");
    outcome.map_err(|e| e.to_string())
}
