use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use proxima_adapters::FixturePlanetSource;
use proxima_notify::{ExportFormat, RenderStyle};
use proxima_sync::{run_loop, LoopSettings, ProximaConfig, ServiceContext, SyncPipeline, Trigger};
use proxima_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "proxima")]
#[command(about = "Proxima planet tracker", version)]
struct Cli {
    /// Overrides PROXIMA_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Overrides PROXIMA_OUTPUT_DIR.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Read planets from a JSON file instead of the upstream API.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll on the configured interval inside the schedule window.
    Run,
    /// Run one cycle now, ignoring the schedule window.
    Once,
    /// Deliver the stored snapshot to the configured sinks without fetching.
    Notify {
        #[arg(long)]
        style: Option<RenderStyle>,
    },
    /// Write the stored snapshot to a file.
    Export {
        #[arg(long, value_parser = parse_export_format, default_value = "csv")]
        format: ExportFormat,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print snapshot statistics.
    Status,
    /// Serve the JSON API next to the poll loop.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn parse_export_format(value: &str) -> Result<ExportFormat, String> {
    match value.parse::<RenderStyle>() {
        Ok(RenderStyle::Export(format)) => Ok(format),
        Ok(other) => Err(format!("{other} is not an export format")),
        Err(err) => Err(err.to_string()),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(err) => warn!(error = %err, "listening for ctrl-c failed; shutting down"),
        }
        trigger.cancel();
    });
    cancel
}

async fn build_pipeline(cli: &Cli, config: &ProximaConfig) -> Result<SyncPipeline> {
    let pipeline = SyncPipeline::from_config(config).await?;
    Ok(match &cli.fixture {
        Some(path) => pipeline.with_source(Box::new(FixturePlanetSource::new(path.clone()))),
        None => pipeline,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ProximaConfig::from_env().context("loading configuration")?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }

    let pipeline = build_pipeline(&cli, &config).await?;

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => {
            let cancel = shutdown_token();
            run_loop(Arc::new(pipeline), LoopSettings::from_config(&config), cancel).await;
        }
        Commands::Once => {
            let report = pipeline.run_reported(Trigger::Forced).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                bail!("cycle failed: {}", report.error.unwrap_or_default());
            }
        }
        Commands::Notify { style } => {
            let report = pipeline.notify_current(*style).await?;
            for outcome in &report.outcomes {
                match &outcome.error {
                    None => println!("{} {}: {} page(s) sent", outcome.sink, outcome.style, outcome.pages_sent),
                    Some(err) => println!("{} {}: failed: {err}", outcome.sink, outcome.style),
                }
            }
            if !report.all_delivered() {
                bail!("{} delivery(ies) failed", report.failures());
            }
        }
        Commands::Export { format, out } => {
            let (file_name, bytes) = pipeline.export_current(*format).await?;
            let path = out.clone().unwrap_or_else(|| config.output_dir.join(&file_name));
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {} ({} bytes)", path.display(), bytes.len());
        }
        Commands::Status => {
            let (_, stats) = pipeline.current_snapshot().await?;
            println!("planets:      {}", stats.total_entities);
            println!("latest week:  {}", stats.latest_period_or_zero());
            println!("last update:  {}", stats.last_update_label());
            println!("schedule:     {}", pipeline.gate());
            println!(
                "sinks:        {}",
                pipeline.notifier().map(|n| n.targets().len()).unwrap_or(0)
            );
        }
        Commands::Serve { port } => {
            let cancel = shutdown_token();
            let pipeline = Arc::new(pipeline);
            let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.web_port)));
            let state = AppState::new(pipeline.clone(), ServiceContext::new(config.environment.clone()));

            let poller = tokio::spawn(run_loop(
                pipeline.clone(),
                LoopSettings::from_config(&config),
                cancel.clone(),
            ));
            let served = proxima_web::serve(addr, state, cancel.clone()).await;
            cancel.cancel();
            poller.await.context("joining poll loop")?;
            served?;
        }
    }

    Ok(())
}
