//! Policy snapshot assembly from state exporter samples

use crate::exposition::{MetricKind, Sample};
use crate::models::{ClusterPod, ContainerPolicy, PodKey, PolicySnapshot};
use std::collections::HashMap;

/// Accumulates state exporter samples into a [`PolicySnapshot`].
///
/// Node precedence does not depend on line order: the `node` label on
/// resource request/limit series wins over `kube_pod_info`.
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    snapshot: PolicySnapshot,
    info_nodes: HashMap<PodKey, String>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sample: &Sample) {
        let identity = sample.identity();

        match sample.kind() {
            MetricKind::ResourceRequests | MetricKind::ResourceLimits => {
                let Some(key) = identity.container_key() else {
                    return;
                };
                if !identity.node.is_empty() {
                    self.snapshot
                        .pods
                        .entry(key.pod_key())
                        .or_default()
                        .node = Some(identity.node.clone());
                }

                let resources = self.snapshot.containers.entry(key).or_default();
                let is_request = sample.kind() == MetricKind::ResourceRequests;
                let slot = match (sample.label("resource"), is_request) {
                    (Some("cpu"), true) => &mut resources.cpu_request,
                    (Some("cpu"), false) => &mut resources.cpu_limit,
                    (Some("memory"), true) => &mut resources.memory_request,
                    (Some("memory"), false) => &mut resources.memory_limit,
                    _ => return,
                };
                *slot = Some(sample.value);
            }
            MetricKind::PodInfo => {
                if let Some(pod) = identity.pod_key() {
                    self.info_nodes.insert(pod, identity.node);
                }
            }
            MetricKind::PodOwner => {
                if let (Some(pod), Some(kind)) = (identity.pod_key(), sample.label("owner_kind")) {
                    self.snapshot.pods.entry(pod).or_default().owner_kind = Some(kind.to_string());
                }
            }
            MetricKind::CpuUsageSeconds | MetricKind::MemoryUsageBytes => {}
        }
    }

    pub fn extend<I: IntoIterator<Item = Sample>>(&mut self, samples: I) {
        for sample in samples {
            self.add(&sample);
        }
    }

    pub fn finish(mut self) -> PolicySnapshot {
        for (pod, node) in self.info_nodes {
            let metadata = self.snapshot.pods.entry(pod).or_default();
            if metadata.node.is_none() {
                metadata.node = Some(node);
            }
        }
        self.snapshot
    }
}

/// Fill node and owner gaps from a cluster-wide pod listing.
///
/// Exporter data always wins; only absent fields are filled.
pub fn enrich_from_cluster(policy: &mut PolicySnapshot, pods: &[ClusterPod]) -> usize {
    let mut filled = 0;

    for pod in pods {
        let Some(key) = PodKey::new(&pod.namespace, &pod.name) else {
            continue;
        };
        let metadata = policy.pods.entry(key).or_default();

        if metadata.node.is_none() && pod.node.is_some() {
            metadata.node = pod.node.clone();
            filled += 1;
        }
        if metadata.owner_kind.is_none() && pod.owner_kind.is_some() {
            metadata.owner_kind = pod.owner_kind.clone();
            filled += 1;
        }
    }

    filled
}

impl ContainerPolicy {
    /// Whether any resource was declared
    pub fn is_declared(&self) -> bool {
        self.cpu_request.is_some()
            || self.cpu_limit.is_some()
            || self.memory_request.is_some()
            || self.memory_limit.is_some()
    }
}
