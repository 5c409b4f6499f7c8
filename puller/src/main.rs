//! HWPC puller
//!
//! Tails a capped report log, validates each document and routes it through
//! the filters declared in the configuration. Every filter gets a consumer
//! that logs the reports it receives on the `hwpc::reports` target.

use anyhow::{Context, Result};
use clap::Parser;
use hwpc_puller::{
    metrics, Consumer, FilterRegistry, LoggingConsumer, Pipeline, PipelineConfig, Store,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "hwpc-puller")]
#[command(about = "Route HWPC reports from a capped log to filters", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (TOML); HWPC__* environment variables override it
    #[arg(short, long, env = "HWPC_CONFIG")]
    config: Option<PathBuf>,

    /// Append the documents of a JSON-lines file to the log before starting
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Stop after this long (e.g. "30s", "5m"); default runs until Ctrl-C
    #[arg(long)]
    run_for: Option<String>,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    metrics: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.json_logs);

    let config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    info!(pipeline = %config.name, store = ?config.store, filters = config.filters.len(), "Starting HWPC puller");

    let store = Store::open(&config.store, &config.name).context("Failed to open report store")?;
    if let Some(path) = &args.seed {
        let appended = seed_store(&store, path).await?;
        info!(appended, path = %path.display(), "Seeded report log");
    }

    let registry = FilterRegistry::from_specs(&config.filters, |spec| {
        vec![Arc::new(LoggingConsumer::new(&spec.name)) as Arc<dyn Consumer>]
    })?;

    let run_for = args
        .run_for
        .as_deref()
        .map(hwpc_shared::utils::parse_duration)
        .transpose()
        .context("Failed to parse --run-for")?;

    let running = Pipeline::new(config, store.reader(), Arc::new(registry))
        .start()
        .await?;

    let stop = running.stop_token();
    tokio::spawn(async move {
        match run_for {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(duration) => {}
                }
            }
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
            }
        }
        info!("Stopping pipeline");
        stop.cancel();
    });

    let outcome = running.wait().await;

    if args.metrics {
        println!("{}", metrics::encode_metrics()?);
    }

    let summary = outcome?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Append every line of a JSON-lines file. Lines that are not JSON are skipped.
async fn seed_store(store: &Store, path: &std::path::Path) -> Result<usize> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut appended = 0;
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(document) => {
                store.append(document)?;
                appended += 1;
            }
            Err(e) => warn!(line = line_no + 1, error = %e, "Skipping malformed seed line"),
        }
    }
    Ok(appended)
}
