//! Core data models for the usage scraper

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Container name the runtime reports for the pause/infrastructure container
pub const INFRA_CONTAINER: &str = "POD";

/// Placeholder for node and owner kind when no exporter reported them
pub const UNKNOWN: &str = "unknown";

/// Container identity, the join key across exporters and across cycles.
///
/// Ordering is namespace, then pod, then container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl IdentityKey {
    /// Build a key, rejecting empty fields and the infrastructure container
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Option<Self> {
        let namespace = namespace.into();
        let pod = pod.into();
        let container = container.into();

        if namespace.is_empty()
            || pod.is_empty()
            || container.is_empty()
            || container == INFRA_CONTAINER
        {
            return None;
        }

        Some(Self {
            namespace,
            pod,
            container,
        })
    }

    /// The pod this container belongs to
    pub fn pod_key(&self) -> PodKey {
        PodKey {
            namespace: self.namespace.clone(),
            pod: self.pod.clone(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Pod identity, used for metadata that is not container scoped
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub pod: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Option<Self> {
        let namespace = namespace.into();
        let pod = pod.into();
        if namespace.is_empty() || pod.is_empty() {
            return None;
        }
        Some(Self { namespace, pod })
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

/// Usage observed for one container in one scrape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    /// Cumulative CPU seconds (monotonic counter)
    pub cpu_seconds: Option<f64>,
    /// Memory usage in bytes (gauge)
    pub memory_bytes: Option<f64>,
    /// Wall-clock time the sample was scraped
    pub timestamp: DateTime<Utc>,
}

/// All container usage captured in one scrape cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    entries: BTreeMap<IdentityKey, UsageEntry>,
}

impl UsageSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a CPU counter value; a later value for the same key wins
    pub fn record_cpu(&mut self, key: IdentityKey, cpu_seconds: f64, timestamp: DateTime<Utc>) {
        let entry = self.entry(key, timestamp);
        entry.cpu_seconds = Some(cpu_seconds);
        entry.timestamp = timestamp;
    }

    /// Record a memory gauge value
    pub fn record_memory(&mut self, key: IdentityKey, memory_bytes: f64, timestamp: DateTime<Utc>) {
        let entry = self.entry(key, timestamp);
        entry.memory_bytes = Some(memory_bytes);
    }

    fn entry(&mut self, key: IdentityKey, timestamp: DateTime<Utc>) -> &mut UsageEntry {
        self.entries.entry(key).or_insert_with(|| UsageEntry {
            cpu_seconds: None,
            memory_bytes: None,
            timestamp,
        })
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&UsageEntry> {
        self.entries.get(key)
    }

    /// Iterate entries in identity order
    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, &UsageEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Declared resources of one container, from the state exporter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerPolicy {
    pub cpu_request: Option<f64>,
    pub cpu_limit: Option<f64>,
    pub memory_request: Option<f64>,
    pub memory_limit: Option<f64>,
}

/// Placement and ownership of one pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodMetadata {
    pub node: Option<String>,
    pub owner_kind: Option<String>,
}

/// Point-in-time resource policy for the cluster
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub containers: HashMap<IdentityKey, ContainerPolicy>,
    pub pods: HashMap<PodKey, PodMetadata>,
}

impl PolicySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container(&self, key: &IdentityKey) -> Option<&ContainerPolicy> {
        self.containers.get(key)
    }

    pub fn pod(&self, key: &PodKey) -> Option<&PodMetadata> {
        self.pods.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.pods.is_empty()
    }
}

/// One correlated output row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub identity: IdentityKey,
    pub node: String,
    pub owner_kind: String,
    /// CPU usage rate in cores
    pub cpu_usage_cores: f64,
    pub memory_usage_bytes: u64,
    pub cpu_request_cores: f64,
    pub cpu_limit_cores: f64,
    pub memory_request_bytes: f64,
    pub memory_limit_bytes: f64,
    pub timestamp: DateTime<Utc>,
}

/// A pod matched by a label selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSummary {
    pub name: String,
    pub phase: String,
}

/// Cluster-wide pod listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPod {
    pub namespace: String,
    pub name: String,
    pub node: Option<String>,
    pub owner_kind: Option<String>,
    pub containers: Vec<String>,
}

/// A scrape target reachable from this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Human readable name (pod name for tunnelled targets)
    pub name: String,
    pub url: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Metrics URL for a local forwarded port
    pub fn local(name: impl Into<String>, port: u16) -> Self {
        Self::new(name, format!("http://127.0.0.1:{}/metrics", port))
    }
}
