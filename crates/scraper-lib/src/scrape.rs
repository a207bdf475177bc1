//! Exposition scraping
//!
//! Fetches Prometheus text from exporter endpoints. Usage endpoints are
//! scraped concurrently; a failing endpoint only loses its own contribution.

use crate::models::Endpoint;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Source of Prometheus text exposition
#[async_trait]
pub trait ExpositionSource: Send + Sync {
    /// Fetch the full exposition body of `endpoint`
    async fn fetch(&self, endpoint: &Endpoint) -> Result<String>;
}

/// [`ExpositionSource`] over HTTP GET
#[derive(Debug, Clone)]
pub struct HttpExpositionSource {
    client: Client,
    timeout: Duration,
}

impl HttpExpositionSource {
    /// Create a source whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ExpositionSource for HttpExpositionSource {
    async fn fetch(&self, endpoint: &Endpoint) -> Result<String> {
        let response = self
            .client
            .get(&endpoint.url)
            .send()
            .await
            .with_context(|| format!("Failed to scrape {}", endpoint.url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Exporter error ({}) from {}: {}", status, endpoint.url, body);
        }

        response
            .text()
            .await
            .with_context(|| format!("Failed to read body from {}", endpoint.url))
    }
}

/// One successfully scraped exposition body
#[derive(Debug, Clone)]
pub struct ScrapedBody {
    pub endpoint: Endpoint,
    pub body: String,
    /// When the response arrived
    pub scraped_at: DateTime<Utc>,
}

/// Bodies and failures of one concurrent scrape
#[derive(Debug, Default)]
pub struct ScrapeResults {
    /// Successful scrapes, in endpoint order
    pub bodies: Vec<ScrapedBody>,
    pub failures: Vec<(Endpoint, String)>,
}

impl ScrapeResults {
    pub fn attempted(&self) -> usize {
        self.bodies.len() + self.failures.len()
    }
}

/// Scrape every endpoint concurrently, collecting results per task
pub async fn scrape_all(
    source: Arc<dyn ExpositionSource>,
    endpoints: Vec<Endpoint>,
) -> ScrapeResults {
    let mut tasks = JoinSet::new();
    for (index, endpoint) in endpoints.into_iter().enumerate() {
        let source = Arc::clone(&source);
        tasks.spawn(async move {
            let outcome = source
                .fetch(&endpoint)
                .await
                .map(|body| (body, Utc::now()));
            (index, endpoint, outcome)
        });
    }

    let mut collected = Vec::new();
    let mut results = ScrapeResults::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(entry) => collected.push(entry),
            Err(e) => warn!(error = %e, "Scrape task aborted"),
        }
    }
    collected.sort_by_key(|(index, _, _)| *index);

    for (_, endpoint, outcome) in collected {
        match outcome {
            Ok((body, scraped_at)) => {
                debug!(endpoint = %endpoint.name, bytes = body.len(), "Scraped endpoint");
                results.bodies.push(ScrapedBody {
                    endpoint,
                    body,
                    scraped_at,
                });
            }
            Err(e) => {
                warn!(endpoint = %endpoint.name, url = %endpoint.url, error = %e, "Scrape failed");
                results.failures.push((endpoint, format!("{:#}", e)));
            }
        }
    }

    results
}
