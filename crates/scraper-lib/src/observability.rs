//! Observability infrastructure for the usage scraper
//!
//! Provides:
//! - Prometheus metrics (cycle duration, emitted records, scrape and sink failures, tunnel states)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for cycle durations (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ScraperMetricsInner> = OnceLock::new();

struct ScraperMetricsInner {
    cycle_duration_seconds: Histogram,
    cycles_total: IntCounterVec,
    records_emitted: IntCounter,
    scrape_errors: IntCounterVec,
    tunnels_ready: IntGauge,
    tunnels_failed: IntGauge,
    sink_failures: IntCounter,
    counter_resets: IntCounter,
    baseline_containers: IntGauge,
}

impl ScraperMetricsInner {
    fn new() -> Self {
        Self {
            cycle_duration_seconds: register_histogram!(
                "usage_scraper_cycle_duration_seconds",
                "Wall-clock duration of one scrape cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            cycles_total: register_int_counter_vec!(
                "usage_scraper_cycles_total",
                "Scrape cycles by outcome",
                &["outcome"]
            )
            .expect("Failed to register cycles_total"),

            records_emitted: register_int_counter!(
                "usage_scraper_records_emitted_total",
                "Unified records handed to the sink"
            )
            .expect("Failed to register records_emitted"),

            scrape_errors: register_int_counter_vec!(
                "usage_scraper_scrape_errors_total",
                "Failed scrapes by exporter",
                &["exporter"]
            )
            .expect("Failed to register scrape_errors"),

            tunnels_ready: register_int_gauge!(
                "usage_scraper_tunnels_ready",
                "Tunnels that became ready in the last cycle"
            )
            .expect("Failed to register tunnels_ready"),

            tunnels_failed: register_int_gauge!(
                "usage_scraper_tunnels_failed",
                "Tunnels that failed in the last cycle"
            )
            .expect("Failed to register tunnels_failed"),

            sink_failures: register_int_counter!(
                "usage_scraper_sink_failures_total",
                "Record batches the sink did not accept"
            )
            .expect("Failed to register sink_failures"),

            counter_resets: register_int_counter!(
                "usage_scraper_counter_resets_total",
                "CPU counters observed lower than their baseline"
            )
            .expect("Failed to register counter_resets"),

            baseline_containers: register_int_gauge!(
                "usage_scraper_baseline_containers",
                "Containers held in the rate baseline"
            )
            .expect("Failed to register baseline_containers"),
        }
    }
}

/// Scraper metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ScraperMetrics {
    _private: (),
}

impl Default for ScraperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScraperMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScraperMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScraperMetricsInner {
        GLOBAL_METRICS.get_or_init(ScraperMetricsInner::new)
    }

    pub fn observe_cycle(&self, duration_secs: f64, outcome: &str) {
        let inner = self.inner();
        inner.cycle_duration_seconds.observe(duration_secs);
        inner.cycles_total.with_label_values(&[outcome]).inc();
    }

    pub fn add_records_emitted(&self, count: usize) {
        self.inner().records_emitted.inc_by(count as u64);
    }

    pub fn inc_scrape_errors(&self, exporter: &str) {
        self.inner().scrape_errors.with_label_values(&[exporter]).inc();
    }

    pub fn set_tunnels(&self, ready: usize, failed: usize) {
        self.inner().tunnels_ready.set(ready as i64);
        self.inner().tunnels_failed.set(failed as i64);
    }

    pub fn inc_sink_failures(&self) {
        self.inner().sink_failures.inc();
    }

    pub fn add_counter_resets(&self, count: usize) {
        self.inner().counter_resets.inc_by(count as u64);
    }

    pub fn set_baseline_size(&self, containers: usize) {
        self.inner().baseline_containers.set(containers as i64);
    }
}

/// Structured logger for scraper events
///
/// Every event carries a fixed `event` field and the cluster name so log
/// pipelines can filter on them.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    /// Log scraper startup
    pub fn log_startup(&self, version: &str, mode: &str) {
        info!(
            event = "scraper_started",
            cluster = %self.cluster,
            scraper_version = %version,
            mode = %mode,
            "Usage scraper started"
        );
    }

    /// Log scraper shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "scraper_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Usage scraper shutting down"
        );
    }

    pub fn log_baseline_established(&self, containers: usize) {
        info!(
            event = "baseline_established",
            cluster = %self.cluster,
            containers = containers,
            "Baseline captured, no records emitted this cycle"
        );
    }

    pub fn log_cycle_completed(
        &self,
        cycle: u64,
        emitted: usize,
        cold_starts: usize,
        without_policy: usize,
        elapsed_ms: u128,
    ) {
        info!(
            event = "cycle_completed",
            cluster = %self.cluster,
            cycle = cycle,
            emitted = emitted,
            cold_starts = cold_starts,
            without_policy = without_policy,
            elapsed_ms = elapsed_ms,
            "Scrape cycle completed"
        );
    }

    pub fn log_tunnel_state(&self, pod: &str, local_port: u16, from: &str, to: &str) {
        match to {
            "failed" => warn!(
                event = "tunnel_state_changed",
                cluster = %self.cluster,
                pod = %pod,
                local_port = local_port,
                from = %from,
                to = %to,
                "Tunnel failed"
            ),
            _ => debug!(
                event = "tunnel_state_changed",
                cluster = %self.cluster,
                pod = %pod,
                local_port = local_port,
                from = %from,
                to = %to,
                "Tunnel state changed"
            ),
        }
    }

    pub fn log_delivery(&self, submitted: usize, accepted: usize) {
        info!(
            event = "delivery_succeeded",
            cluster = %self.cluster,
            submitted = submitted,
            accepted = accepted,
            "Records delivered"
        );
    }

    pub fn log_delivery_failed(&self, submitted: usize, error: &str) {
        warn!(
            event = "delivery_failed",
            cluster = %self.cluster,
            submitted = submitted,
            error = %error,
            "Record delivery failed, batch dropped"
        );
    }
}
