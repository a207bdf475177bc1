//! Record delivery
//!
//! Hands correlated records to the ingestion service. Delivery is
//! at-most-once: a failed batch is reported to the caller and dropped.

use crate::models::UnifiedRecord;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Errors from a delivery attempt
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("ingest rejected batch ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("ingest request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Destination for correlated records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Deliver one batch, returning how many records were accepted
    async fn deliver(&self, records: &[UnifiedRecord]) -> Result<usize, SinkError>;
}

/// One record as the ingestion service expects it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    /// Sample time, seconds since the epoch
    pub ts: f64,
    pub cluster: String,
    pub node: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    /// Owner kind of the pod
    pub kind: String,
    /// CPU usage rate in cores
    pub cpu_usage_sec: f64,
    pub mem_usage_b: u64,
    pub cpu_request: f64,
    pub cpu_limit: f64,
    pub mem_request: f64,
    pub mem_limit: f64,
}

impl WireRecord {
    pub fn from_record(record: &UnifiedRecord, cluster: &str) -> Self {
        Self {
            ts: record.timestamp.timestamp_millis() as f64 / 1000.0,
            cluster: cluster.to_string(),
            node: record.node.clone(),
            namespace: record.identity.namespace.clone(),
            pod: record.identity.pod.clone(),
            container: record.identity.container.clone(),
            kind: record.owner_kind.clone(),
            cpu_usage_sec: record.cpu_usage_cores,
            mem_usage_b: record.memory_usage_bytes,
            cpu_request: record.cpu_request_cores,
            cpu_limit: record.cpu_limit_cores,
            mem_request: record.memory_request_bytes,
            mem_limit: record.memory_limit_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
struct IngestBatch<'a> {
    records: &'a [WireRecord],
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    inserted: usize,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

/// Where the bearer token comes from
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// A pre-issued token used as is
    Static(String),
    /// Obtain a token from the auth endpoint with a username and password
    Login {
        url: String,
        username: String,
        password: String,
    },
}

/// [`RecordSink`] posting `{"records": [...]}` to the ingestion service
pub struct HttpSink {
    client: Client,
    ingest_url: String,
    cluster: String,
    tokens: TokenSource,
    cached_token: Mutex<Option<String>>,
}

impl HttpSink {
    pub fn new(
        ingest_url: impl Into<String>,
        cluster: impl Into<String>,
        tokens: TokenSource,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            ingest_url: ingest_url.into(),
            cluster: cluster.into(),
            tokens,
            cached_token: Mutex::new(None),
        })
    }

    async fn token(&self) -> Result<String, SinkError> {
        let (url, username, password) = match &self.tokens {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Login {
                url,
                username,
                password,
            } => (url, username, password),
        };

        let mut cached = self.cached_token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let response = self
            .client
            .post(url)
            .json(&LoginRequest {
                username,
                password,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Auth(format!("{}: {}", status, body)));
        }

        let login: LoginResponse = response.json().await?;
        debug!(auth_url = %url, "Obtained ingest token");
        *cached = Some(login.access_token.clone());
        Ok(login.access_token)
    }

    async fn forget_token(&self) {
        self.cached_token.lock().await.take();
    }
}

#[async_trait]
impl RecordSink for HttpSink {
    async fn deliver(&self, records: &[UnifiedRecord]) -> Result<usize, SinkError> {
        let token = self.token().await?;
        let wire: Vec<WireRecord> = records
            .iter()
            .map(|r| WireRecord::from_record(r, &self.cluster))
            .collect();

        let response = self
            .client
            .post(&self.ingest_url)
            .bearer_auth(token)
            .json(&IngestBatch { records: &wire })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            // Next cycle logs in again
            self.forget_token().await;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let accepted: IngestResponse = response.json().await?;
        Ok(accepted.inserted)
    }
}

/// Logs records instead of delivering them
#[derive(Debug, Clone)]
pub struct LogSink {
    cluster: String,
}

impl LogSink {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }
}

#[async_trait]
impl RecordSink for LogSink {
    async fn deliver(&self, records: &[UnifiedRecord]) -> Result<usize, SinkError> {
        for record in records {
            let wire = WireRecord::from_record(record, &self.cluster);
            info!(
                event = "record",
                cluster = %wire.cluster,
                node = %wire.node,
                namespace = %wire.namespace,
                pod = %wire.pod,
                container = %wire.container,
                kind = %wire.kind,
                cpu_usage_cores = wire.cpu_usage_sec,
                mem_usage_bytes = wire.mem_usage_b,
                cpu_request = wire.cpu_request,
                cpu_limit = wire.cpu_limit,
                mem_request = wire.mem_request,
                mem_limit = wire.mem_limit,
                "Dry run record"
            );
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IdentityKey;
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;

    fn record() -> UnifiedRecord {
        UnifiedRecord {
            identity: IdentityKey::new("shop", "web-1", "app").unwrap(),
            node: "node-a".to_string(),
            owner_kind: "ReplicaSet".to_string(),
            cpu_usage_cores: 0.25,
            memory_usage_bytes: 104857600,
            cpu_request_cores: 0.5,
            cpu_limit_cores: 1.0,
            memory_request_bytes: 67108864.0,
            memory_limit_bytes: 134217728.0,
            timestamp: Utc.timestamp_opt(1_700_000_010, 500_000_000).unwrap(),
        }
    }

    fn login(server: &mockito::Server) -> TokenSource {
        TokenSource::Login {
            url: format!("{}/auth", server.url()),
            username: "user".to_string(),
            password: "pass".to_string(),
        }
    }

    #[test]
    fn test_wire_record_shape() {
        let wire = WireRecord::from_record(&record(), "my-cluster");
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["ts"], 1_700_000_010.5);
        assert_eq!(json["cluster"], "my-cluster");
        assert_eq!(json["namespace"], "shop");
        assert_eq!(json["pod"], "web-1");
        assert_eq!(json["container"], "app");
        assert_eq!(json["kind"], "ReplicaSet");
        assert_eq!(json["cpu_usage_sec"], 0.25);
        assert_eq!(json["mem_usage_b"], 104857600);
        assert_eq!(json["mem_limit"], 134217728.0);
    }

    #[tokio::test]
    async fn test_deliver_with_static_token() {
        let mut server = mockito::Server::new_async().await;
        let ingest = server
            .mock("POST", "/ingest")
            .match_header("authorization", "Bearer static-token")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "records": [{"namespace": "shop", "pod": "web-1", "container": "app"}]
            })))
            .with_status(200)
            .with_body(r#"{"inserted": 1}"#)
            .create_async()
            .await;

        let sink = HttpSink::new(
            format!("{}/ingest", server.url()),
            "my-cluster",
            TokenSource::Static("static-token".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        let accepted = sink.deliver(&[record()]).await.unwrap();
        assert_eq!(accepted, 1);
        ingest.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_token_cached_across_batches() {
        let mut server = mockito::Server::new_async().await;
        let auth = server
            .mock("POST", "/auth")
            .match_body(Matcher::Json(serde_json::json!({
                "username": "user",
                "password": "pass"
            })))
            .with_status(200)
            .with_body(r#"{"access_token": "jwt-1", "token_type": "bearer", "expires_in": 3600}"#)
            .expect(1)
            .create_async()
            .await;
        let ingest = server
            .mock("POST", "/ingest")
            .match_header("authorization", "Bearer jwt-1")
            .with_status(200)
            .with_body(r#"{"inserted": 1}"#)
            .expect(2)
            .create_async()
            .await;

        let sink = HttpSink::new(
            format!("{}/ingest", server.url()),
            "my-cluster",
            login(&server),
            Duration::from_secs(5),
        )
        .unwrap();

        sink.deliver(&[record()]).await.unwrap();
        sink.deliver(&[record()]).await.unwrap();

        auth.assert_async().await;
        ingest.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_clears_token() {
        let mut server = mockito::Server::new_async().await;
        let auth = server
            .mock("POST", "/auth")
            .with_status(200)
            .with_body(r#"{"access_token": "expired"}"#)
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", "/ingest")
            .with_status(401)
            .with_body(r#"{"detail": "Invalid or expired token"}"#)
            .create_async()
            .await;

        let sink = HttpSink::new(
            format!("{}/ingest", server.url()),
            "my-cluster",
            login(&server),
            Duration::from_secs(5),
        )
        .unwrap();

        let first = sink.deliver(&[record()]).await.unwrap_err();
        assert!(matches!(first, SinkError::Rejected { status: 401, .. }));
        let second = sink.deliver(&[record()]).await.unwrap_err();
        assert!(matches!(second, SinkError::Rejected { status: 401, .. }));

        auth.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_failure_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth")
            .with_status(401)
            .with_body("Bad credentials")
            .create_async()
            .await;

        let sink = HttpSink::new(
            format!("{}/ingest", server.url()),
            "my-cluster",
            login(&server),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = sink.deliver(&[record()]).await.unwrap_err();
        assert!(matches!(err, SinkError::Auth(ref message) if message.contains("Bad credentials")));
    }

    #[tokio::test]
    async fn test_log_sink_accepts_everything() {
        let sink = LogSink::new("my-cluster");
        assert_eq!(sink.deliver(&[record(), record()]).await.unwrap(), 2);
    }
}
