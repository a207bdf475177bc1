//! Kubernetes API access
//!
//! Used to discover tunnel targets by label selector and, optionally, to
//! fill node/owner gaps left by the state exporter.

use crate::models::{ClusterPod, PodSummary};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    Client,
};

/// Pod phase of a pod that can be tunnelled to
pub const RUNNING_PHASE: &str = "Running";

/// Cluster API operations the scraper needs
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List pods in `namespace` matching a label `selector` (e.g. `app=cadvisor`)
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSummary>>;

    /// List every pod in the cluster with its placement and owner
    async fn list_all_pods(&self) -> Result<Vec<ClusterPod>>;
}

/// [`ClusterApi`] backed by a `kube` client
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient configuration (in-cluster or kubeconfig)
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSummary>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(selector);

        let pod_list = pods
            .list(&params)
            .await
            .with_context(|| format!("Failed to list pods in {} matching {}", namespace, selector))?;

        Ok(pod_list.into_iter().filter_map(summarize).collect())
    }

    async fn list_all_pods(&self) -> Result<Vec<ClusterPod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());

        let pod_list = pods
            .list(&ListParams::default())
            .await
            .context("Failed to list cluster pods")?;

        let pods: Vec<ClusterPod> = pod_list.into_iter().filter_map(describe).collect();
        tracing::debug!(pods = pods.len(), "Listed cluster pods");
        Ok(pods)
    }
}

fn summarize(pod: Pod) -> Option<PodSummary> {
    let name = pod.metadata.name?;
    let phase = pod.status.and_then(|s| s.phase).unwrap_or_default();
    Some(PodSummary { name, phase })
}

fn describe(pod: Pod) -> Option<ClusterPod> {
    let metadata = pod.metadata;
    let name = metadata.name?;
    let namespace = metadata.namespace.unwrap_or_default();

    // Prefer the controlling owner when several are listed
    let owners = metadata.owner_references.unwrap_or_default();
    let owner_kind = owners
        .iter()
        .find(|o| o.controller == Some(true))
        .or_else(|| owners.first())
        .map(|o| o.kind.clone());

    let (node, containers) = match pod.spec {
        Some(spec) => (
            spec.node_name,
            spec.containers.into_iter().map(|c| c.name).collect(),
        ),
        None => (None, Vec::new()),
    };

    Some(ClusterPod {
        namespace,
        name,
        node,
        owner_kind,
        containers,
    })
}
