//! Argus command line entry point.

use anyhow::{Context, Result};
use argus_pipeline::config::{ArgusConfig, LogFormat, ServiceConfig};
use argus_pipeline::{
    connect_loader, load_staging, InferenceClient, MediaFrameSource, PaletteClassifier, Pipeline,
    PipelineSettings, RunMode, RunSummary, StagingReport, StagingWriter, StoreError,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "argus", version, about = "Windowed batch loader for object detections")]
struct Cli {
    /// Configuration file, layered over the defaults
    #[arg(long, global = true, env = "ARGUS_CONFIG")]
    config: Option<PathBuf>,

    /// Exit non-zero if any row failed to load
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detect objects and write the staging file only
    Detect,
    /// Load a staging file into the warehouse
    Load {
        /// Staging file; defaults to `staging.path`
        #[arg(long)]
        staging: Option<PathBuf>,
    },
    /// Detect, stage and load in one pass
    Run,
    /// Show row count and most frequent classes in the warehouse table
    Stats,
    /// Summarize a staging file
    Inspect {
        #[arg(long)]
        staging: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let config =
        ArgusConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    init_logging(&config.service)?;
    config.validate().context("Invalid configuration")?;

    info!(service = %config.service.name, "Starting Argus");

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Detect => {
            config.validate_detector()?;
            let pipeline = build_pipeline(&config)?.build()?;
            let summary = pipeline.run(&cancel).await;
            Ok(report(&summary, cli.strict))
        }

        Command::Run => {
            config.validate_detector()?;
            config.validate_database()?;

            let builder = build_pipeline(&config)?;
            let (builder, store) = match connect_loader(&config, &cancel).await {
                Ok((loader, store)) => (builder.loader(loader), Some(store)),
                Err(e @ StoreError::Cancelled) => {
                    warn!("Cancelled before the warehouse connection was established");
                    let summary = RunSummary::store_unavailable(RunMode::Full, &e);
                    return Ok(report(&summary, cli.strict));
                }
                Err(e) => {
                    error!(error = %e, "Warehouse unavailable, continuing with staging only");
                    (builder.loader_unavailable(&e), None)
                }
            };

            let summary = builder.build()?.run(&cancel).await;
            if let Some(store) = store {
                store.close().await;
            }
            Ok(report(&summary, cli.strict))
        }

        Command::Load { staging } => {
            config.validate_database()?;
            let path = staging.unwrap_or_else(|| config.staging.path.clone());

            let (loader, store) = match connect_loader(&config, &cancel).await {
                Ok(connected) => connected,
                Err(e) => {
                    error!(error = %e, "Warehouse unavailable, nothing loaded");
                    let summary = RunSummary::store_unavailable(RunMode::Load, &e);
                    return Ok(report(&summary, cli.strict));
                }
            };
            let summary = load_staging(&loader, &path, &cancel).await;
            store.close().await;
            Ok(report(&summary, cli.strict))
        }

        Command::Stats => {
            config.validate_database()?;
            let (loader, store) = connect_loader(&config, &cancel)
                .await
                .context("Failed to connect to warehouse")?;
            let stats = loader
                .stats()
                .await
                .context("Failed to query table statistics")?;
            store.close().await;

            println!("Table {}: {} rows", loader.table(), stats.total_rows);
            println!("Top classes:");
            for (class, count) in &stats.top_classes {
                println!("  {:<20} {}", class, count);
            }
            Ok(true)
        }

        Command::Inspect { staging } => {
            let path = staging.unwrap_or_else(|| config.staging.path.clone());
            let report = StagingReport::from_path(&path)
                .with_context(|| format!("Failed to read staging file {}", path.display()))?;
            print!("{}", report);
            Ok(true)
        }
    }
}

/// Pipeline with every dependency except the loader.
fn build_pipeline(config: &ArgusConfig) -> Result<argus_pipeline::PipelineBuilder> {
    let detector = InferenceClient::new(
        &config.detector.endpoint,
        config.detector.request_timeout(),
        config.detector.jpeg_quality,
    );
    let frames = MediaFrameSource::new(
        &config.sources.ffmpeg_bin,
        &config.sources.ffprobe_bin,
        config.sources.frame_stride,
    );
    let staging = StagingWriter::create(&config.staging.path)
        .context("Failed to create staging file")?;

    Ok(Pipeline::builder(PipelineSettings::from_config(config))
        .detector(Arc::new(detector))
        .colors(Arc::new(PaletteClassifier::new()))
        .frame_source(Arc::new(frames))
        .staging(Arc::new(staging)))
}

/// Print the summary and decide the exit status.
fn report(summary: &RunSummary, strict: bool) -> bool {
    println!("{}", summary);
    !summary.is_failure(strict)
}

/// Initialize tracing/logging. `RUST_LOG` overrides the configured level.
fn init_logging(config: &ServiceConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?
        .add_directive("sqlx=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing in-flight work");
        }
        _ = terminate => {
            info!("Received SIGTERM, finishing in-flight work");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_load_with_global_flags() {
        let cli = Cli::parse_from(["argus", "load", "--staging", "x.csv", "--strict"]);
        assert!(cli.strict);
        assert!(matches!(cli.command, Command::Load { staging: Some(ref p) } if p == &PathBuf::from("x.csv")));
    }
}
