//! Sampling scheduler
//!
//! Drives the fixed-period cycle: acquire usage endpoints, scrape both
//! exporters, correlate against the baseline, deliver, replace the baseline.
//! Cycles never overlap and each one is bounded by a timeout.


use crate::cluster::ClusterApi;
use crate::correlate::{
    collect_usage, correlate, enrich_from_cluster, CorrelationStats, CounterResetPolicy,
    PolicyBuilder,
};
use crate::exposition::{samples, Exporter};
use crate::health::{components, HealthRegistry};
use crate::models::{Endpoint, PolicySnapshot, UnifiedRecord, UsageSnapshot};
use crate::observability::{ScraperMetrics, StructuredLogger};
use crate::scrape::{scrape_all, ExpositionSource};
use crate::sink::RecordSink;
use crate::tunnel::{TunnelManager, TunnelSet};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the sampling loop
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period between cycle starts (default: 30 seconds)
    pub interval: Duration,
    /// Upper bound on one cycle, tunnels included (default: 40 seconds)
    pub cycle_timeout: Duration,
    /// Handling of CPU counters lower than their baseline
    pub reset_policy: CounterResetPolicy,
    /// Fill node/owner gaps from a cluster-wide pod listing
    pub enrich_from_cluster: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            cycle_timeout: Duration::from_secs(40),
            reset_policy: CounterResetPolicy::Clamp,
            enrich_from_cluster: false,
        }
    }
}

/// Where usage exposition comes from
pub enum UsageEndpoints {
    /// Tunnels opened to exporter pods for each cycle
    Tunnelled(TunnelManager),
    /// Directly reachable endpoints
    Static(Vec<Endpoint>),
}

/// The previous cycle's usage snapshot.
///
/// Owned by the loop driving the scheduler and replaced only when a cycle
/// completes with a non-empty snapshot.
#[derive(Debug, Default)]
pub struct Baseline {
    snapshot: Option<UsageSnapshot>,
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<&UsageSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn len(&self) -> usize {
        self.snapshot.as_ref().map_or(0, UsageSnapshot::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn replace(&mut self, snapshot: UsageSnapshot) -> Option<UsageSnapshot> {
        self.snapshot.replace(snapshot)
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub usage_endpoints: usize,
    pub usage_failures: usize,
    pub tunnels_ready: usize,
    pub tunnels_failed: usize,
    pub containers: usize,
    pub stats: CorrelationStats,
    /// Records accepted by the sink, `None` when nothing was sent
    pub delivered: Option<usize>,
    pub delivery_error: Option<String>,
    /// Whether this cycle only established the baseline
    pub baseline_only: bool,
}

/// The scrape, correlate and emit loop
pub struct SamplingScheduler {
    endpoints: UsageEndpoints,
    source: Arc<dyn ExpositionSource>,
    state_endpoint: Endpoint,
    sink: Arc<dyn RecordSink>,
    cluster: Option<Arc<dyn ClusterApi>>,
    config: SchedulerConfig,
    health: HealthRegistry,
    metrics: ScraperMetrics,
    logger: StructuredLogger,
    cycles: AtomicU64,
}

impl SamplingScheduler {
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Verify the cluster API answers before anything is scheduled.
    ///
    /// A discovery failure here is a startup error.
    pub async fn preflight(&self) -> Result<()> {
        let UsageEndpoints::Tunnelled(manager) = &self.endpoints else {
            return Ok(());
        };

        match manager.discover().await {
            Ok(targets) => {
                self.health.set_healthy(components::CLUSTER_API).await;
                if targets.is_empty() {
                    warn!(
                        namespace = %manager.config().namespace,
                        selector = %manager.config().selector,
                        "No running usage exporter pods found"
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.health
                    .set_unhealthy(components::CLUSTER_API, format!("{:#}", e))
                    .await;
                Err(e).context("Cluster API preflight failed")
            }
        }
    }

    /// Start the sampling loop, stopping on shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            cycle_timeout_secs = self.config.cycle_timeout.as_secs(),
            "Starting sampling loop"
        );

        let mut baseline = Baseline::new();
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // An in-flight cycle is dropped on shutdown; its tunnels
                    // are killed when the TunnelSet drops
                    tokio::select! {
                        _ = self.run_bounded(&mut baseline) => {}
                        _ = shutdown.recv() => {
                            info!("Shutdown during cycle, abandoning it");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down sampling loop");
                    break;
                }
            }
        }
    }

    /// Run the baseline cycle, wait one interval, run the emitting cycle
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut baseline = Baseline::new();

        self.run_cycle(&mut baseline)
            .await
            .context("Baseline cycle failed")?;
        if !baseline.is_established() {
            anyhow::bail!("Baseline cycle captured no container usage");
        }

        tokio::time::sleep(self.config.interval).await;

        self.run_cycle(&mut baseline)
            .await
            .context("Emitting cycle failed")
    }

    /// [`run_once`](Self::run_once), abandoned on shutdown.
    ///
    /// Returns `Ok(None)` when interrupted. The abandoned cycle's tunnels
    /// are killed before this returns.
    pub async fn run_once_until(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<Option<CycleReport>> {
        tokio::select! {
            report = self.run_once() => report.map(Some),
            _ = shutdown.recv() => {
                info!("Shutdown during single run, abandoning it");
                Ok(None)
            }
        }
    }

    /// Run one cycle under the cycle timeout, recording the outcome
    async fn run_bounded(&self, baseline: &mut Baseline) {
        let start = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.cycle_timeout, self.run_cycle(baseline)).await;
        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(_)) => {
                self.metrics.observe_cycle(elapsed, "success");
                self.health.set_healthy(components::SCRAPER).await;
                self.health.set_ready(true).await;
            }
            Ok(Err(e)) => {
                warn!(
                    error = %format!("{:#}", e),
                    "Scrape cycle failed, keeping previous baseline"
                );
                self.metrics.observe_cycle(elapsed, "failed");
                self.health
                    .set_unhealthy(components::SCRAPER, format!("{:#}", e))
                    .await;
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.cycle_timeout.as_secs(),
                    "Scrape cycle timed out, keeping previous baseline"
                );
                self.metrics.observe_cycle(elapsed, "timeout");
                self.health
                    .set_unhealthy(components::SCRAPER, "cycle timed out")
                    .await;
            }
        }
    }

    /// Run one full cycle against `baseline`.
    ///
    /// Every tunnel opened here is closed before returning, on success and
    /// on error; if the future is dropped, the tunnel set's `Drop` kills them.
    pub async fn run_cycle(&self, baseline: &mut Baseline) -> Result<CycleReport> {
        let start = Instant::now();
        let mut report = CycleReport {
            cycle: self.cycles.fetch_add(1, Ordering::SeqCst) + 1,
            ..CycleReport::default()
        };

        let (endpoints, mut tunnels) = self.acquire(&mut report).await?;
        let outcome = self.sample(endpoints, baseline, &mut report).await;
        if let Some(tunnels) = tunnels.as_mut() {
            tunnels.close().await;
        }
        outcome?;

        self.logger.log_cycle_completed(
            report.cycle,
            report.stats.emitted,
            report.stats.cold_starts,
            report.stats.without_policy,
            start.elapsed().as_millis(),
        );
        Ok(report)
    }

    async fn acquire(
        &self,
        report: &mut CycleReport,
    ) -> Result<(Vec<Endpoint>, Option<TunnelSet>)> {
        let manager = match &self.endpoints {
            UsageEndpoints::Static(endpoints) => return Ok((endpoints.clone(), None)),
            UsageEndpoints::Tunnelled(manager) => manager,
        };

        let tunnels = match manager.open().await {
            Ok(tunnels) => tunnels,
            Err(e) => {
                self.health
                    .set_unhealthy(components::CLUSTER_API, format!("{:#}", e))
                    .await;
                return Err(e);
            }
        };
        self.health.set_healthy(components::CLUSTER_API).await;

        report.tunnels_ready = tunnels.ready_count();
        report.tunnels_failed = tunnels.failed_count();
        self.metrics
            .set_tunnels(report.tunnels_ready, report.tunnels_failed);
        self.health
            .set_partial(components::TUNNELS, tunnels.ready_count(), tunnels.len(), "tunnels")
            .await;

        Ok((tunnels.ready_endpoints(), Some(tunnels)))
    }

    async fn sample(
        &self,
        endpoints: Vec<Endpoint>,
        baseline: &mut Baseline,
        report: &mut CycleReport,
    ) -> Result<()> {
        if endpoints.is_empty() {
            anyhow::bail!("No usage endpoints available");
        }
        report.usage_endpoints = endpoints.len();

        let usage = scrape_all(Arc::clone(&self.source), endpoints).await;
        report.usage_failures = usage.failures.len();
        for _ in &usage.failures {
            self.metrics.inc_scrape_errors("usage");
        }
        if usage.bodies.is_empty() {
            anyhow::bail!("All {} usage endpoints failed", usage.attempted());
        }

        let mut current = UsageSnapshot::new();
        for scraped in &usage.bodies {
            collect_usage(
                &mut current,
                samples(&scraped.body, Exporter::Usage),
                scraped.scraped_at,
            );
        }
        report.containers = current.len();

        let policy = self.fetch_policy().await;

        match baseline.snapshot() {
            None => {
                report.baseline_only = true;
                self.logger.log_baseline_established(current.len());
            }
            Some(previous) => {
                let correlation =
                    correlate(&current, Some(previous), &policy, self.config.reset_policy);
                self.metrics
                    .add_counter_resets(correlation.stats.counter_resets);
                report.stats = correlation.stats;
                self.emit(&correlation.records, report).await;
            }
        }

        if current.is_empty() {
            warn!("Usage exporters returned no container samples, keeping previous baseline");
        } else {
            baseline.replace(current);
            self.metrics.set_baseline_size(baseline.len());
        }
        Ok(())
    }

    /// Build the policy snapshot; failures degrade to an empty policy
    async fn fetch_policy(&self) -> PolicySnapshot {
        let mut builder = PolicyBuilder::new();
        match self.source.fetch(&self.state_endpoint).await {
            Ok(body) => builder.extend(samples(&body, Exporter::State)),
            Err(e) => {
                self.metrics.inc_scrape_errors("state");
                warn!(
                    url = %self.state_endpoint.url,
                    error = %format!("{:#}", e),
                    "State exporter scrape failed, using default policy values"
                );
            }
        }
        let mut policy = builder.finish();

        if self.config.enrich_from_cluster {
            if let Some(cluster) = &self.cluster {
                match cluster.list_all_pods().await {
                    Ok(pods) => {
                        let filled = enrich_from_cluster(&mut policy, &pods);
                        debug!(filled = filled, "Enriched pod metadata from cluster API");
                    }
                    Err(e) => warn!(error = %format!("{:#}", e), "Cluster enrichment failed"),
                }
            }
        }

        policy
    }

    async fn emit(&self, records: &[UnifiedRecord], report: &mut CycleReport) {
        if records.is_empty() {
            debug!("No records to deliver");
            return;
        }

        match self.sink.deliver(records).await {
            Ok(accepted) => {
                self.metrics.add_records_emitted(records.len());
                self.logger.log_delivery(records.len(), accepted);
                self.health.set_healthy(components::SINK).await;
                report.delivered = Some(accepted);
            }
            Err(e) => {
                self.metrics.inc_sink_failures();
                self.logger.log_delivery_failed(records.len(), &e.to_string());
                self.health
                    .set_degraded(components::SINK, e.to_string())
                    .await;
                report.delivery_error = Some(e.to_string());
            }
        }
    }
}

/// Builder for the sampling scheduler
pub struct SamplingSchedulerBuilder {
    endpoints: Option<UsageEndpoints>,
    source: Option<Arc<dyn ExpositionSource>>,
    state_endpoint: Option<Endpoint>,
    sink: Option<Arc<dyn RecordSink>>,
    cluster: Option<Arc<dyn ClusterApi>>,
    config: SchedulerConfig,
    health: HealthRegistry,
    logger: Option<StructuredLogger>,
}

impl SamplingSchedulerBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            endpoints: None,
            source: None,
            state_endpoint: None,
            sink: None,
            cluster: None,
            config: SchedulerConfig::default(),
            health: HealthRegistry::new(),
            logger: None,
        }
    }

    /// Scrape usage through tunnels opened by `manager`
    pub fn tunnels(mut self, manager: TunnelManager) -> Self {
        self.endpoints = Some(UsageEndpoints::Tunnelled(manager));
        self
    }

    /// Scrape usage from fixed endpoints
    pub fn static_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = Some(UsageEndpoints::Static(endpoints));
        self
    }

    pub fn source(mut self, source: Arc<dyn ExpositionSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn state_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.state_endpoint = Some(endpoint);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Cluster API used for metadata enrichment
    pub fn cluster(mut self, cluster: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the scheduler
    pub fn build(self) -> Result<SamplingScheduler> {
        let endpoints = self
            .endpoints
            .ok_or_else(|| anyhow::anyhow!("Usage endpoints are required"))?;
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Exposition source is required"))?;
        let state_endpoint = self
            .state_endpoint
            .ok_or_else(|| anyhow::anyhow!("State endpoint is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Sink is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Interval must be greater than zero");
        }

        Ok(SamplingScheduler {
            endpoints,
            source,
            state_endpoint,
            sink,
            cluster: self.cluster,
            config: self.config,
            health: self.health,
            metrics: ScraperMetrics::new(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("unknown")),
            cycles: AtomicU64::new(0),
        })
    }
}

impl Default for SamplingSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
