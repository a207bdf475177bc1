//! Identity resolution from exporter label sets

use super::{IdentityLabels, Labels};
use crate::models::{IdentityKey, PodKey};

/// Identity fields read from a label set; unresolved fields are empty
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub node: String,
}

impl ResolvedIdentity {
    /// Container key, or `None` for empty fields and the infrastructure container
    pub fn container_key(&self) -> Option<IdentityKey> {
        IdentityKey::new(&self.namespace, &self.pod, &self.container)
    }

    pub fn pod_key(&self) -> Option<PodKey> {
        PodKey::new(&self.namespace, &self.pod)
    }
}

/// Resolve identity using the ordered label names in `scheme`.
///
/// The first label present with a non-empty value wins.
pub fn resolve(labels: &Labels, scheme: &IdentityLabels) -> ResolvedIdentity {
    ResolvedIdentity {
        namespace: first_present(labels, scheme.namespace),
        pod: first_present(labels, scheme.pod),
        container: first_present(labels, scheme.container),
        node: first_present(labels, scheme.node),
    }
}

fn first_present(labels: &Labels, names: &[&str]) -> String {
    names
        .iter()
        .filter_map(|name| labels.get(*name))
        .find(|value| !value.is_empty())
        .cloned()
        .unwrap_or_default()
}
