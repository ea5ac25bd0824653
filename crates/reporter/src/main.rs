//! dmon-reporter: container statistics reporter
//!
//! Follows the containers of the local Docker daemon, derives CPU and
//! memory metrics and ships them to a remote collector, buffering locally
//! while the collector is unreachable.

use anyhow::{Context, Result};
use clap::Parser;
use dmon_reporter::api;
use reporter_lib::{
    config::ReporterConfig,
    health::{components, HealthRegistry},
    monitor::MonitorBuilder,
    observability::{ReporterMetrics, StructuredLogger},
    publish::{NetworkSink, PublisherBuilder, PublisherConfig},
    runtime::create_runtime,
    store::create_cache,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const REPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time the publisher gets to drain in-flight records on shutdown
const PUBLISHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "dmon-reporter", version, about = "Container statistics reporter")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "DMON_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "Starting dmon-reporter");

    let config = ReporterConfig::load(&args.config)?;
    info!(
        host = %config.host_name,
        master = %config.master.addr,
        protocol = %config.master.protocol,
        "Reporter configured"
    );

    let health_registry = HealthRegistry::new();
    let metrics = ReporterMetrics::new();
    let logger = StructuredLogger::new(&config.host_name);
    logger.log_startup(
        REPORTER_VERSION,
        config.cache.provider.as_str(),
        &config.master.addr,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Setup failures below are fatal
    let runtime = create_runtime(&config.runtime)?;
    runtime
        .ping()
        .await
        .context("Container runtime is not reachable")?;

    let cache = create_cache(&config.cache)
        .await
        .context("Failed to open offline cache")?;
    let sink = Arc::new(NetworkSink::from_config(&config.master)?);

    let monitor = MonitorBuilder::new()
        .runtime(runtime)
        .settings(config.monitor.clone())
        .metrics(metrics.clone())
        .logger(logger.clone())
        .health(health_registry.clone())
        .build()?;
    monitor.start().await?;
    let records = monitor.metrics()?;

    let publisher = PublisherBuilder::new()
        .sink(sink)
        .cache(cache)
        .config(PublisherConfig::from(&config.master))
        .metrics(metrics.clone())
        .logger(logger.clone())
        .health(health_registry.clone())
        .build()?;
    let mut publisher_handle = tokio::spawn(publisher.run(records, shutdown_tx.subscribe()));

    health_registry.set_ready(true).await;
    info!(containers = monitor.len(), "Reporter running");

    let reason = shutdown_signal().await?;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;
    health_registry
        .set_degraded(components::MONITOR, "shutting down")
        .await;

    // Stopping the monitor closes the record stream; the publisher drains it.
    monitor.stop().await;

    match tokio::time::timeout(PUBLISHER_DRAIN_TIMEOUT, &mut publisher_handle).await {
        Ok(result) => result.context("Publisher task failed")??,
        Err(_) => {
            warn!(
                timeout_secs = PUBLISHER_DRAIN_TIMEOUT.as_secs(),
                "Publisher did not drain in time, forcing shutdown"
            );
            let _ = shutdown_tx.send(());
            publisher_handle.await.context("Publisher task failed")??;
        }
    }

    let _ = shutdown_tx.send(());
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<&'static str> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}
