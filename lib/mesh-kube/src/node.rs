//! Node label lookups for pod locality

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::core::PartialObjectMeta;
use kube::{Api, ResourceExt};
use kube_runtime::reflector::{ObjectRef, Store};
use mesh_core::locality::NodeLookup;
use std::collections::BTreeMap;
use tracing::debug;

/// Local node stores consulted before the API server: the metadata-only
/// watch when there is one, then the full node watch
pub struct NodeLabelCache {
    metadata: Option<Store<PartialObjectMeta<Node>>>,
    nodes: Store<Node>,
}

impl NodeLabelCache {
    pub fn new(nodes: Store<Node>) -> Self {
        Self { metadata: None, nodes }
    }

    pub fn with_metadata(mut self, metadata: Store<PartialObjectMeta<Node>>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.metadata
            .as_ref()
            .and_then(|store| store.get(&ObjectRef::new(name)))
            .map(|n| n.labels().clone())
            .or_else(|| self.nodes.get(&ObjectRef::new(name)).map(|n| n.labels().clone()))
    }
}

/// Node lookup backed by a watch store, falling back to a direct read
pub struct KubeNodeLookup {
    api: Api<Node>,
    cache: NodeLabelCache,
}

impl KubeNodeLookup {
    pub fn new(api: Api<Node>, cache: NodeLabelCache) -> Self {
        Self { api, cache }
    }
}

#[async_trait]
impl NodeLookup for KubeNodeLookup {
    fn cached_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.cache.labels(name)
    }

    async fn fetch_labels(&self, name: &str) -> mesh_core::Result<BTreeMap<String, String>> {
        debug!("Node {} not cached, reading it from the API server", name);
        let node = self.api.get(name).await?;
        Ok(node.labels().clone())
    }
}
