//! Offlaine Manager - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use offlaine_manager::capability::{BenchmarkSettings, BenchmarkStatus, WorkloadSizes};
use offlaine_manager::device::SystemDeviceProbe;
use offlaine_manager::monitor::SystemUsageSampler;
use offlaine_manager::{
    ArtifactDescriptor, BenchmarkRunner, ManagerConfig, ManagerError, ModelCategory, Services,
    TransferEvent, TransferStatus, metrics,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "offlaine-manager")]
#[command(about = "Offline AI model manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    log_format: String,

    /// Render Prometheus metrics to stderr after the command
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search the model catalog
    Search {
        #[arg(default_value = "")]
        query: String,
        /// Restrict to a category (e.g. code-helper)
        #[arg(long)]
        category: Option<ModelCategory>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Download a model; Ctrl+C pauses it
    Download {
        id: String,
        /// Direct payload URL for models missing from the catalog
        #[arg(long)]
        url: Option<String>,
        /// Declared size in MB for models missing from the catalog
        #[arg(long)]
        size_mb: Option<u64>,
    },
    /// Resume a paused download
    Resume { id: String },
    /// Cancel a download and discard its payload
    Cancel { id: String },
    /// List installed models and known transfers
    List,
    /// Delete an installed model
    Delete { id: String },
    /// Recompute storage analytics
    Analytics,
    /// Remove duplicates, flag stale models and clean temp files
    Optimize,
    /// Benchmark this device; Ctrl+C abandons the run
    Benchmark {
        /// Use tiny workloads and a short thermal window
        #[arg(long)]
        quick: bool,
    },
    /// Show the cached benchmark status and model recommendations
    Recommend,
    /// Toggle the favorite flag for a model
    Favorite { id: String },
    /// Sample resource usage until Ctrl+C or the duration elapses
    Monitor {
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
        #[arg(long)]
        duration_secs: Option<u64>,
        /// Attribute samples to this model
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for command output
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
    }

    let config = ManagerConfig::load(cli.config.clone())?;
    config.validate()?;

    tracing::info!(
        data_dir = ?config.data_dir,
        max_concurrent_downloads = config.max_concurrent_downloads,
        catalog_file = ?config.catalog_file,
        "Configuration loaded"
    );

    let prometheus_handle = metrics::setup_metrics()?;
    let services = Services::from_config(config).await?;

    let installed = services.downloads.installed().await?.len();
    metrics::update_installed_artifacts(installed);

    run(cli.command, &services).await?;

    if cli.print_metrics {
        eprintln!("{}", prometheus_handle.render());
    }
    Ok(())
}

async fn run(command: Command, services: &Services) -> Result<()> {
    match command {
        Command::Search {
            query,
            category,
            limit,
        } => {
            let results = services.catalog.search(&query, category, limit).await?;
            print_json(&results)
        }
        Command::Download { id, url, size_mb } => {
            let descriptor = resolve_descriptor(services, &id, url, size_mb).await?;
            let started = services.downloads.acquire(descriptor).await?;
            if started.status == TransferStatus::Completed {
                tracing::info!(model_id = %id, "Already installed");
                return print_json(&started);
            }
            follow_transfer(services, &id).await
        }
        Command::Resume { id } => {
            services.downloads.resume(&id).await?;
            follow_transfer(services, &id).await
        }
        Command::Cancel { id } => {
            services.downloads.cancel(&id).await?;
            print_json(&serde_json::json!({ "cancelled": id }))
        }
        Command::List => {
            let installed = services.downloads.installed().await?;
            let transfers = services.downloads.states().await;
            let favorites = services.personalization.favorites().await?;
            print_json(&serde_json::json!({
                "installed": installed,
                "transfers": transfers,
                "favorites": favorites,
            }))
        }
        Command::Delete { id } => {
            let reclaimed = services.downloads.delete(&id).await?;
            print_json(&serde_json::json!({ "deleted": id, "reclaimed_bytes": reclaimed }))
        }
        Command::Analytics => {
            let analytics = services.analytics.recompute().await;
            print_json(&analytics)
        }
        Command::Optimize => {
            let report = services.analytics.optimize(&services.downloads).await?;
            print_json(&report)
        }
        Command::Benchmark { quick } => run_benchmark(services, quick).await,
        Command::Recommend => match services.benchmarks.status().await? {
            BenchmarkStatus::Completed(result) => print_json(&serde_json::json!({
                "tier": result.tier,
                "tier_description": result.tier.description(),
                "size_guidance": result.tier.size_guidance(),
                "ai_score": result.ai_score,
                "recommendations": result.recommendations,
            })),
            other => {
                tracing::warn!("No completed benchmark; run `benchmark` first");
                print_json(&other)
            }
        },
        Command::Favorite { id } => {
            let favorited = services.personalization.toggle_favorite(&id).await?;
            print_json(&serde_json::json!({ "model_id": id, "favorited": favorited }))
        }
        Command::Monitor {
            interval_secs,
            duration_secs,
            model,
        } => run_monitor(services, interval_secs, duration_secs, model).await,
    }
}

/// Catalog entry for `id`, or an ad-hoc descriptor from CLI flags
async fn resolve_descriptor(
    services: &Services,
    id: &str,
    url: Option<String>,
    size_mb: Option<u64>,
) -> Result<ArtifactDescriptor> {
    if let Some(descriptor) = services.catalog.details(id).await? {
        return Ok(match url {
            Some(url) => descriptor.with_download_url(url),
            None => descriptor,
        });
    }

    let size_mb = size_mb
        .with_context(|| format!("Model '{}' is not in the catalog; pass --size-mb", id))?;
    let descriptor = ArtifactDescriptor::new(id, size_mb);
    Ok(match url {
        Some(url) => descriptor.with_download_url(url),
        None => descriptor,
    })
}

/// Report progress until the transfer settles; Ctrl+C pauses it
async fn follow_transfer(services: &Services, id: &str) -> Result<()> {
    let mut events = services.downloads.subscribe();
    let mut last_percent = None;

    let settled = loop {
        let snapshot = services.downloads.progress(id).await?;
        if !matches!(
            snapshot.status,
            TransferStatus::Pending | TransferStatus::Downloading
        ) {
            break snapshot;
        }

        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!(model_id = %id, "Pausing transfer");
                break services.downloads.pause(id).await?;
            }
            event = events.recv() => match event {
                Ok(TransferEvent::Progress(progress)) if progress.id == id => {
                    let percent = progress.progress.floor() as u32;
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        tracing::info!(
                            model_id = %id,
                            percent,
                            bytes_per_sec = progress.bytes_per_sec as u64,
                            eta_secs = ?progress.eta_secs,
                            "Downloading"
                        );
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break services.downloads.progress(id).await?,
            }
        }
    };

    print_json(&settled)?;
    if settled.status == TransferStatus::Failed {
        anyhow::bail!(
            "Download of '{}' failed: {}",
            id,
            settled
                .last_error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_benchmark(services: &Services, quick: bool) -> Result<()> {
    let token = CancellationToken::new();
    let watcher = {
        let token = token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Abandoning benchmark");
            token.cancel();
        })
    };

    let runner = if quick {
        quick_runner(services)
    } else {
        services.benchmarks.clone()
    };

    let outcome = runner
        .run(
            |fraction, test| {
                tracing::info!(
                    percent = (fraction * 100.0).round() as u32,
                    test,
                    "Benchmark progress"
                );
            },
            &token,
        )
        .await;
    watcher.abort();

    match outcome {
        Ok(result) => print_json(&result),
        Err(ManagerError::BenchmarkAbandoned) => {
            tracing::warn!("Benchmark abandoned, previous results kept");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Runner over the shared record store with tiny workloads
fn quick_runner(services: &Services) -> Arc<BenchmarkRunner> {
    Arc::new(BenchmarkRunner::new(
        services.records.clone(),
        Arc::new(SystemDeviceProbe::new(services.config.data_dir.clone())),
        services.benchmarks.engine().clone(),
        BenchmarkSettings {
            thermal_window: Duration::from_secs(3),
            thermal_interval: Duration::from_secs(1),
            scratch_dir: services.config.scratch_dir(),
            sizes: WorkloadSizes::quick(),
        },
    ))
}

async fn run_monitor(
    services: &Services,
    interval_secs: u64,
    duration_secs: Option<u64>,
    model: Option<String>,
) -> Result<()> {
    let monitor = services.monitor.clone();
    let sampler = SystemUsageSampler::new();
    let token = CancellationToken::new();

    let stopper = {
        let token = token.clone();
        tokio::spawn(async move {
            match duration_secs {
                Some(secs) => {
                    tokio::select! {
                        _ = shutdown_signal() => {}
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    }
                }
                None => shutdown_signal().await,
            }
            token.cancel();
        })
    };

    if let Some(id) = &model {
        services.personalization.record_usage(id).await?;
    }
    monitor.start_session(model).await;
    monitor
        .run(&sampler, Duration::from_secs(interval_secs.max(1)), &token)
        .await;
    stopper.abort();

    let report = monitor.report().await;
    monitor.stop_session().await;
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", rendered);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
