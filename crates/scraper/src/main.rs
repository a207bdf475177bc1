//! Container Usage Scraper
//!
//! Samples cAdvisor and kube-state-metrics on a fixed interval, joins
//! per-container CPU rates and memory with declared requests and limits,
//! and delivers the records to the ingestion service.

use anyhow::{Context, Result};
use clap::Parser;
use container_scraper::{api, config::ScraperConfig};
use scraper_lib::{
    cluster::{ClusterApi, KubeClusterApi},
    health::HealthRegistry,
    observability::{ScraperMetrics, StructuredLogger},
    scheduler::SamplingSchedulerBuilder,
    scrape::HttpExpositionSource,
    sink::{HttpSink, LogSink, RecordSink},
    tunnel::{KubectlTransport, TunnelManager},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SCRAPER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long the sampling loop gets to wind down after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "container-scraper")]
#[command(author, version, about = "Kubernetes container usage scraper", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "SCRAPER_CONFIG")]
    config: Option<PathBuf>,

    /// Run one baseline cycle and one emitting cycle, then exit
    #[arg(long)]
    once: bool,

    /// Log records instead of delivering them
    #[arg(long)]
    dry_run: bool,

    /// Override the health/metrics API port
    #[arg(long)]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();

    info!("Starting container-scraper");

    let mut config = ScraperConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.api_port {
        config.api_port = port;
    }
    info!(
        cluster = %config.cluster_name,
        tunnels = config.uses_tunnels(),
        state_endpoint = %config.state_endpoint,
        "Scraper configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let metrics = ScraperMetrics::new();

    let logger = StructuredLogger::new(&config.cluster_name);
    let mode = if cli.once { "once" } else { "continuous" };
    logger.log_startup(SCRAPER_VERSION, mode);

    let source = Arc::new(HttpExpositionSource::new(config.scrape_timeout())?);

    let sink: Arc<dyn RecordSink> = if cli.dry_run {
        info!("Dry run, records are logged instead of delivered");
        Arc::new(LogSink::new(&config.cluster_name))
    } else {
        Arc::new(
            HttpSink::new(
                &config.ingest_url,
                &config.cluster_name,
                config.token_source(),
                config.sink_timeout(),
            )
            .context("Failed to create ingestion client")?,
        )
    };

    let mut builder = SamplingSchedulerBuilder::new()
        .source(source)
        .state_endpoint(config.state_endpoint())
        .sink(sink)
        .config(config.scheduler_config())
        .health(health_registry.clone())
        .logger(logger.clone());

    if config.uses_tunnels() || config.enrich_from_cluster {
        let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::try_default().await?);
        builder = builder.cluster(Arc::clone(&cluster));

        if config.uses_tunnels() {
            let transport = KubectlTransport::new(&config.kubectl_binary)
                .with_context(config.kube_context.clone());
            builder = builder.tunnels(TunnelManager::new(
                cluster,
                Arc::new(transport),
                config.tunnel_config(),
                logger.clone(),
            ));
        }
    }

    if !config.uses_tunnels() {
        builder = builder.static_endpoints(config.static_endpoints());
    }

    let scheduler = builder.build()?;
    scheduler.preflight().await?;

    if cli.once {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let signals = tokio::spawn(async move {
            let reason = shutdown_signal().await;
            let _ = shutdown_tx.send(());
            reason
        });

        let Some(report) = scheduler.run_once_until(shutdown_rx).await? else {
            let reason = signals.await??;
            logger.log_shutdown(reason);
            anyhow::bail!("Single run interrupted ({})", reason);
        };
        signals.abort();

        let summary = serde_json::json!({
            "cycle": report.cycle,
            "usage_endpoints": report.usage_endpoints,
            "usage_failures": report.usage_failures,
            "tunnels_ready": report.tunnels_ready,
            "tunnels_failed": report.tunnels_failed,
            "containers": report.containers,
            "emitted": report.stats.emitted,
            "cold_starts": report.stats.cold_starts,
            "counter_resets": report.stats.counter_resets,
            "without_policy": report.stats.without_policy,
            "delivered": report.delivered,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);

        if let Some(e) = report.delivery_error {
            anyhow::bail!("Delivery failed: {}", e);
        }
        logger.log_shutdown("single run completed");
        return Ok(());
    }

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            error!(error = %format!("{:#}", e), "API server stopped");
        }
    });

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut sampling = tokio::spawn(scheduler.run(shutdown_rx));

    let reason = tokio::select! {
        reason = shutdown_signal() => reason?,
        joined = &mut sampling => {
            if let Err(e) = joined {
                error!(error = %e, "Sampling loop panicked");
            }
            "sampling loop exited"
        }
    };

    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());

    if !sampling.is_finished() {
        match tokio::time::timeout(SHUTDOWN_GRACE, sampling).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Sampling loop panicked during shutdown"),
            Err(_) => warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Sampling loop did not stop in time"
            ),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let reason = tokio::select! {
        _ = sigint.recv() => "SIGINT received",
        _ = sigterm.recv() => "SIGTERM received",
    };
    Ok(reason)
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C received")
}
