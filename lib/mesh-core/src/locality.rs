//! Pod locality resolution

use crate::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Pod label carrying an explicit locality
pub const LOCALITY_LABEL: &str = "mesh.datum.net/locality";
pub const REGION_LABEL: &str = "topology.kubernetes.io/region";
pub const REGION_LABEL_LEGACY: &str = "failure-domain.beta.kubernetes.io/region";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const ZONE_LABEL_LEGACY: &str = "failure-domain.beta.kubernetes.io/zone";
pub const SUBZONE_LABEL: &str = "topology.datum.net/subzone";

/// Access to node labels
#[async_trait]
pub trait NodeLookup: Send + Sync {
    /// Labels from the local node caches
    fn cached_labels(&self, name: &str) -> Option<BTreeMap<String, String>>;

    /// Labels fetched straight from the API server
    async fn fetch_labels(&self, name: &str) -> Result<BTreeMap<String, String>>;
}

/// Resolves `region/zone/subzone` of pods
#[derive(Clone)]
pub struct LocalityResolver {
    nodes: Arc<dyn NodeLookup>,
}

impl LocalityResolver {
    pub fn new(nodes: Arc<dyn NodeLookup>) -> Self {
        Self { nodes }
    }

    /// Locality of a pod; empty when unknown
    pub async fn pod_locality(&self, pod: &Pod) -> String {
        if let Some(label) = pod.metadata.labels.as_ref().and_then(|l| l.get(LOCALITY_LABEL)) {
            return locality_from_label(label);
        }

        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
            return String::new();
        };

        let labels = match self.nodes.cached_labels(node_name) {
            Some(labels) => labels,
            None => match self.nodes.fetch_labels(node_name).await {
                Ok(labels) => labels,
                Err(e) => {
                    warn!("unable to get node {} for pod locality: {}", node_name, e);
                    return String::new();
                }
            },
        };

        node_locality(&labels)
    }
}

/// Locality label values may use dots as separators since slashes are not
/// allowed in label values
fn locality_from_label(label: &str) -> String {
    if label.contains('/') {
        label.to_string()
    } else {
        label.replace('.', "/")
    }
}

/// Locality from node topology labels
pub fn node_locality(labels: &BTreeMap<String, String>) -> String {
    let first = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| labels.get(*k))
            .cloned()
            .unwrap_or_default()
    };
    let region = first(&[REGION_LABEL, REGION_LABEL_LEGACY]);
    let zone = first(&[ZONE_LABEL, ZONE_LABEL_LEGACY]);
    let subzone = first(&[SUBZONE_LABEL]);

    if region.is_empty() && zone.is_empty() && subzone.is_empty() {
        return String::new();
    }
    format!("{}/{}/{}", region, zone, subzone)
}
