use anyhow::Context;
use clap::{Parser, Subcommand};
use sta_sync::config::Config;
use sta_sync::models::EntityId;
use sta_sync::pipeline::Pipeline;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Exit code when a run finished but some observations, channels or
/// branches failed.
const EXIT_PARTIAL: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "sta-sync", version, about = "Sync sensor CSV exports with a SensorThings API server")]
struct Cli {
    /// Path to the YAML configuration
    #[arg(long, short, default_value = "config/config.yaml", env = "STA_SYNC_CONFIG")]
    config: PathBuf,

    /// Also append the log to this file
    #[arg(long, env = "STA_SYNC_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload CSV readings as observations
    Upload {
        /// CSV file or glob pattern, overrides upload.csv_path
        #[arg(long)]
        csv: Option<String>,
    },
    /// Fetch all observations of some Things into a JSON file
    Fetch {
        /// Thing id(s), overrides fetch.thing_ids
        #[arg(long = "thing-id", value_delimiter = ',')]
        thing_ids: Vec<EntityId>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Export located Things with their latest readings into a JSON file
    ExportMap {
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Open `path` for appending so earlier runs stay in the file
fn open_log_file(path: &Path) -> anyhow::Result<Arc<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    Ok(Arc::new(file))
}

fn file_log_layer<S>(file: Arc<File>) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Optional plain-text copy of the log for auditing uploads
    let log_file = cli.log_file.as_deref().map(open_log_file).transpose()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sta_sync=debug,reqwest=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(log_file.map(file_log_layer))
        .init();

    // Load configuration
    let config = Config::load(&cli.config).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. {} exists (or pass --config)\n\
             2. All required environment variables are set (check .env.example)\n\
             3. Create a .env file if needed",
            e,
            cli.config.display()
        )
    })?;
    info!("Configuration loaded, server: {}", config.server.base_url);

    let pipeline = Pipeline::new(config)?;

    tokio::select! {
        outcome = run(&pipeline, cli.command) => outcome,
        _ = shutdown_signal() => {
            warn!("Run interrupted before completion, server state may be partial");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
    }
}

async fn run(pipeline: &Pipeline, command: Command) -> anyhow::Result<ExitCode> {
    let config = pipeline.config();

    let partial = match command {
        Command::Upload { csv } => {
            let report = pipeline
                .run_upload(csv.as_deref())
                .instrument(info_span!("upload"))
                .await?;
            report.has_failures()
        }
        Command::Fetch { thing_ids, output } => {
            let thing_ids = if thing_ids.is_empty() {
                config.fetch.thing_ids.clone()
            } else {
                thing_ids
            };
            let output = output.unwrap_or_else(|| PathBuf::from(&config.fetch.output_path));
            let report = pipeline
                .run_fetch(&thing_ids, &output)
                .instrument(info_span!("fetch"))
                .await?;
            for failure in &report.failures {
                error!("{} could not be fetched: {}", failure.scope, failure.reason);
            }
            !report.failures.is_empty()
        }
        Command::ExportMap { output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(&config.export.output_path));
            let report = pipeline
                .run_export(&output)
                .instrument(info_span!("export_map"))
                .await?;
            for failure in &report.failures {
                error!("Latest readings for {} are missing: {}", failure.scope, failure.reason);
            }
            !report.failures.is_empty()
        }
    };

    if partial {
        warn!("Finished with failures, see log above");
        return Ok(ExitCode::from(EXIT_PARTIAL));
    }

    info!("Finished successfully");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, aborting");
        }
        _ = terminate => {
            info!("Received SIGTERM, aborting");
        }
    }
}
