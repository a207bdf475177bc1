//! Scraper configuration
//!
//! Read from an optional file layered under `SCRAPER_*` environment
//! variables. Every field has a default; invalid values fail startup.

use anyhow::{Context, Result};
use scraper_lib::correlate::CounterResetPolicy;
use scraper_lib::models::Endpoint;
use scraper_lib::scheduler::SchedulerConfig;
use scraper_lib::sink::TokenSource;
use scraper_lib::tunnel::TunnelConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Scraper configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScraperConfig {
    /// Cluster name attached to every delivered record
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between cycle starts
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Upper bound on one cycle in seconds
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    /// What to do with CPU counters lower than their baseline
    #[serde(default)]
    pub counter_reset_policy: CounterResetPolicy,

    /// Fill node/owner gaps from the cluster API every cycle
    #[serde(default)]
    pub enrich_from_cluster: bool,

    /// Fixed usage exporter URLs; when empty, tunnels are opened instead
    #[serde(default)]
    pub usage_endpoints: Vec<String>,

    #[serde(default = "default_state_endpoint")]
    pub state_endpoint: String,

    /// Per-request scrape timeout in seconds
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_secs: u64,

    #[serde(default = "default_tunnel_namespace")]
    pub tunnel_namespace: String,

    #[serde(default = "default_tunnel_selector")]
    pub tunnel_selector: String,

    #[serde(default = "default_tunnel_remote_port")]
    pub tunnel_remote_port: u16,

    #[serde(default = "default_tunnel_ready_timeout")]
    pub tunnel_ready_timeout_secs: u64,

    #[serde(default = "default_tunnel_probe_interval")]
    pub tunnel_probe_interval_ms: u64,

    #[serde(default = "default_kubectl")]
    pub kubectl_binary: String,

    /// Kubeconfig context for port-forwarding
    #[serde(default)]
    pub kube_context: Option<String>,

    #[serde(default = "default_ingest_url")]
    pub ingest_url: String,

    /// Pre-issued bearer token; when unset, one is obtained from `auth_url`
    #[serde(default)]
    pub ingest_token: Option<String>,

    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_sink_timeout")]
    pub sink_timeout_secs: u64,
}

fn default_cluster_name() -> String {
    "my-cluster".to_string()
}

fn default_api_port() -> u16 {
    9102
}

fn default_interval() -> u64 {
    30
}

fn default_cycle_timeout() -> u64 {
    40
}

fn default_state_endpoint() -> String {
    "http://localhost:8080/metrics".to_string()
}

fn default_scrape_timeout() -> u64 {
    5
}

fn default_tunnel_namespace() -> String {
    "kube-system".to_string()
}

fn default_tunnel_selector() -> String {
    "app=cadvisor".to_string()
}

fn default_tunnel_remote_port() -> u16 {
    8080
}

fn default_tunnel_ready_timeout() -> u64 {
    15
}

fn default_tunnel_probe_interval() -> u64 {
    500
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_ingest_url() -> String {
    "http://localhost:8082/ingest".to_string()
}

fn default_auth_url() -> String {
    "http://localhost:8082/auth".to_string()
}

fn default_username() -> String {
    "user".to_string()
}

fn default_password() -> String {
    "pass".to_string()
}

fn default_sink_timeout() -> u64 {
    10
}

fn check_url(field: &str, value: &str) -> Result<()> {
    let url = url::Url::parse(value)
        .with_context(|| format!("{} is not a valid URL: {}", field, value))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("{} must be an http(s) URL: {}", field, value);
    }
    Ok(())
}

impl ScraperConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_sources(path, config::Environment::with_prefix("SCRAPER"))
    }

    /// Load configuration from an optional file and the given environment source
    pub fn from_sources(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                environment
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("usage_endpoints"),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            anyhow::bail!("interval_secs must be greater than zero");
        }
        if self.cycle_timeout_secs == 0 {
            anyhow::bail!("cycle_timeout_secs must be greater than zero");
        }
        if self.scrape_timeout_secs == 0 {
            anyhow::bail!("scrape_timeout_secs must be greater than zero");
        }
        let required = self.cycle_budget_secs();
        if self.cycle_timeout_secs < required {
            anyhow::bail!(
                "cycle_timeout_secs ({}) is below the per-call budget of one cycle ({}s)",
                self.cycle_timeout_secs,
                required
            );
        }
        check_url("state_endpoint", &self.state_endpoint)?;
        check_url("ingest_url", &self.ingest_url)?;
        for endpoint in &self.usage_endpoints {
            check_url("usage_endpoints", endpoint)?;
        }
        Ok(())
    }

    /// Worst case of one cycle when every call uses its full timeout
    pub fn cycle_budget_secs(&self) -> u64 {
        let tunnels = if self.uses_tunnels() {
            self.tunnel_ready_timeout_secs
        } else {
            0
        };
        tunnels + 2 * self.scrape_timeout_secs + self.sink_timeout_secs
    }

    /// Whether usage is scraped through tunnels
    pub fn uses_tunnels(&self) -> bool {
        self.usage_endpoints.is_empty()
    }

    pub fn static_endpoints(&self) -> Vec<Endpoint> {
        self.usage_endpoints
            .iter()
            .map(|url| Endpoint::new(url.clone(), url.clone()))
            .collect()
    }

    pub fn state_endpoint(&self) -> Endpoint {
        Endpoint::new("kube-state-metrics", self.state_endpoint.clone())
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.interval_secs),
            cycle_timeout: Duration::from_secs(self.cycle_timeout_secs),
            reset_policy: self.counter_reset_policy,
            enrich_from_cluster: self.enrich_from_cluster,
        }
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            namespace: self.tunnel_namespace.clone(),
            selector: self.tunnel_selector.clone(),
            remote_port: self.tunnel_remote_port,
            probe_interval: Duration::from_millis(self.tunnel_probe_interval_ms),
            ready_timeout: Duration::from_secs(self.tunnel_ready_timeout_secs),
        }
    }

    pub fn token_source(&self) -> TokenSource {
        match &self.ingest_token {
            Some(token) if !token.is_empty() => TokenSource::Static(token.clone()),
            _ => TokenSource::Login {
                url: self.auth_url.clone(),
                username: self.username.clone(),
                password: self.password.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix("SCRAPER").source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = ScraperConfig::from_sources(None, env(&[])).unwrap();

        assert_eq!(config.cluster_name, "my-cluster");
        assert_eq!(config.interval_secs, 30);
        assert_eq!(config.cycle_timeout_secs, 40);
        assert_eq!(config.cycle_budget_secs(), 35);
        assert_eq!(config.tunnel_namespace, "kube-system");
        assert_eq!(config.tunnel_selector, "app=cadvisor");
        assert_eq!(config.tunnel_remote_port, 8080);
        assert_eq!(config.state_endpoint, "http://localhost:8080/metrics");
        assert_eq!(config.ingest_url, "http://localhost:8082/ingest");
        assert_eq!(config.counter_reset_policy, CounterResetPolicy::Clamp);
        assert!(config.uses_tunnels());
        assert!(matches!(config.token_source(), TokenSource::Login { .. }));

        let tunnels = config.tunnel_config();
        assert_eq!(tunnels.probe_interval, Duration::from_millis(500));
        assert_eq!(tunnels.ready_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_environment_overrides() {
        let config = ScraperConfig::from_sources(
            None,
            env(&[
                ("SCRAPER_INTERVAL_SECS", "60"),
                ("SCRAPER_CLUSTER_NAME", "prod-eu"),
                ("SCRAPER_COUNTER_RESET_POLICY", "rebaseline"),
                ("SCRAPER_ENRICH_FROM_CLUSTER", "true"),
                (
                    "SCRAPER_USAGE_ENDPOINTS",
                    "http://10.0.0.1:8080/metrics,http://10.0.0.2:8080/metrics",
                ),
                ("SCRAPER_INGEST_TOKEN", "static-token"),
            ]),
        )
        .unwrap();

        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.cluster_name, "prod-eu");
        assert_eq!(config.counter_reset_policy, CounterResetPolicy::Rebaseline);
        assert!(config.enrich_from_cluster);
        assert!(!config.uses_tunnels());
        assert_eq!(config.static_endpoints().len(), 2);
        assert_eq!(
            config.static_endpoints()[1].url,
            "http://10.0.0.2:8080/metrics"
        );
        assert!(matches!(config.token_source(), TokenSource::Static(ref t) if t == "static-token"));
        assert_eq!(
            config.scheduler_config().interval,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_file_under_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "cluster_name = \"from-file\"\ninterval_secs = 45\ntunnel_selector = \"k8s-app=cadvisor\""
        )
        .unwrap();

        let config = ScraperConfig::from_sources(
            Some(file.path()),
            env(&[("SCRAPER_INTERVAL_SECS", "15")]),
        )
        .unwrap();

        assert_eq!(config.cluster_name, "from-file");
        assert_eq!(config.interval_secs, 15);
        assert_eq!(config.tunnel_selector, "k8s-app=cadvisor");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ScraperConfig::from_sources(None, env(&[("SCRAPER_INTERVAL_SECS", "0")])).is_err());
        assert!(
            ScraperConfig::from_sources(None, env(&[("SCRAPER_INTERVAL_SECS", "soon")])).is_err()
        );
        assert!(ScraperConfig::from_sources(
            None,
            env(&[("SCRAPER_COUNTER_RESET_POLICY", "ignore")])
        )
        .is_err());
        assert!(ScraperConfig::from_sources(
            None,
            env(&[("SCRAPER_STATE_ENDPOINT", "localhost:8080/metrics")])
        )
        .is_err());
        assert!(ScraperConfig::from_sources(
            None,
            env(&[("SCRAPER_USAGE_ENDPOINTS", "http://10.0.0.1:8080/metrics,not a url")])
        )
        .is_err());
    }

    #[test]
    fn test_cycle_timeout_must_cover_call_budgets() {
        let err =
            ScraperConfig::from_sources(None, env(&[("SCRAPER_CYCLE_TIMEOUT_SECS", "25")]))
                .unwrap_err();
        assert!(err.to_string().contains("cycle_timeout_secs (25)"));

        let err = ScraperConfig::from_sources(
            None,
            env(&[
                ("SCRAPER_CYCLE_TIMEOUT_SECS", "60"),
                ("SCRAPER_SINK_TIMEOUT_SECS", "40"),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("(65s)"));

        let config = ScraperConfig::from_sources(
            None,
            env(&[("SCRAPER_CYCLE_TIMEOUT_SECS", "35")]),
        )
        .unwrap();
        assert_eq!(
            config.scheduler_config().cycle_timeout,
            Duration::from_secs(35)
        );
    }

    #[test]
    fn test_static_endpoints_need_no_tunnel_budget() {
        let config = ScraperConfig::from_sources(
            None,
            env(&[
                ("SCRAPER_CYCLE_TIMEOUT_SECS", "20"),
                ("SCRAPER_USAGE_ENDPOINTS", "http://10.0.0.1:8080/metrics"),
            ]),
        )
        .unwrap();
        assert_eq!(config.cycle_budget_secs(), 20);
    }

    #[test]
    fn test_missing_file_rejected() {
        let result = ScraperConfig::from_sources(
            Some(Path::new("/nonexistent/scraper.toml")),
            env(&[]),
        );
        assert!(result.is_err());
    }
}
