use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use catsync_core::FileAppConfig;
use catsync_mapping::EntityMapper;
use catsync_sync::{Service, ServiceConfig};
use catsync_web::AppState;
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "catsync")]
#[command(about = "Keeps a software catalog in sync with a vendor's resources")]
struct Cli {
    /// Mapping document, overriding CATSYNC_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Accept webhooks, run scheduled resyncs, and serve the HTTP API.
    Serve,
    /// Run one full resync pass and print its summary.
    Resync,
    /// Map a raw JSON document (object or array) and print the entities.
    Map {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = ServiceConfig::from_env();
    if let Some(path) = cli.config {
        config.config_path = path;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Resync => {
            let service = Service::from_config(config)?;
            let summary = service.orchestrator.run_once().await.context("running resync pass")?;
            println!(
                "resync complete: run_id={} created={} modified={} deleted={} upserted={} failed_writes={}",
                summary.run_id,
                summary.entities.created,
                summary.entities.modified,
                summary.deleted,
                summary.upserted,
                summary.failed_writes
            );
            if let Some(reason) = &summary.deletion_skipped {
                println!("stale entities kept: {reason}");
            }
            for (kind, outcome) in &summary.kinds {
                if let Some(err) = &outcome.error {
                    println!("kind {kind} failed: {err}");
                }
            }
        }
        Commands::Map { kind, input } => map(&config, &kind, &input).await?,
    }

    Ok(())
}

async fn serve(config: ServiceConfig) -> Result<()> {
    let service = Service::from_config(config)?;
    let routes = service.register_webhooks().await?;
    service.manager.start();
    info!(routes, "webhook routes registered");

    let mut scheduler = service.orchestrator.maybe_build_scheduler(&service.config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %service.config.resync_cron, "resync scheduler started");
    }

    if service.config.resync_on_start {
        let orchestrator = service.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.run_once().await {
                error!(error = %err, "startup resync failed");
            }
        });
    }

    catsync_web::serve(AppState::from_service(&service), &service.config.bind, shutdown_signal()).await?;

    info!("shutting down");
    service.manager.shutdown().await;
    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "installing ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
}

async fn map(config: &ServiceConfig, kind: &str, input: &PathBuf) -> Result<()> {
    let app = FileAppConfig::new(config.config_path.clone()).load_blocking()?;
    let raw = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let document: JsonValue =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", input.display()))?;
    let items = match document {
        JsonValue::Array(items) => items,
        other => vec![other],
    };

    let mapper = EntityMapper::new();
    let mut entities = Vec::new();
    let mut matched = false;
    for resource in app.resources_for_kind(kind) {
        matched = true;
        let result = mapper.calculate(&items, resource, false)?;
        for (field, expr) in &result.misconfigured {
            warn!(field = %field, expr = %expr, "field resolved to null or failed");
        }
        entities.extend(result.selector_diff.passed);
    }
    if !matched {
        bail!("no resource configured for kind {kind}");
    }
    println!("{}", serde_json::to_string_pretty(&entities)?);
    Ok(())
}
