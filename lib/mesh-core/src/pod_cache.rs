//! Pod lookups by address and by name

use crate::model::Event;
use crate::store::{object_key, ObjectStore};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct PodIndex {
    by_ip: HashMap<String, Arc<Pod>>,
    /// Pod key to the address it is indexed under
    ip_by_key: HashMap<String, String>,
}

/// Address index over pods, maintained in ingestion order
pub struct PodCache {
    index: RwLock<PodIndex>,
    store: ObjectStore<Pod>,
}

impl PodCache {
    pub fn new(store: ObjectStore<Pod>) -> Self {
        Self {
            index: RwLock::new(PodIndex::default()),
            store,
        }
    }

    /// Apply a pod event to the address index
    pub async fn on_event(&self, pod: &Pod, event: Event) {
        let key = object_key(&pod.namespace().unwrap_or_default(), &pod.name_any());
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty());
        let terminated = matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        );

        let mut index = self.index.write().await;

        if let Some(previous) = index.ip_by_key.remove(&key) {
            let owned = index
                .by_ip
                .get(&previous)
                .is_some_and(|p| object_key(&p.namespace().unwrap_or_default(), &p.name_any()) == key);
            if owned {
                index.by_ip.remove(&previous);
            }
        }

        if event == Event::Delete || terminated {
            debug!("Pod {} removed from address index", key);
            return;
        }

        if let Some(ip) = ip {
            index.by_ip.insert(ip.clone(), Arc::new(pod.clone()));
            index.ip_by_key.insert(key, ip);
        }
    }

    pub async fn get_pod_by_ip(&self, address: &str) -> Option<Arc<Pod>> {
        self.index.read().await.by_ip.get(address).cloned()
    }

    pub fn get_pod(&self, name: &str, namespace: &str) -> Option<Arc<Pod>> {
        self.store.get(namespace, name)
    }
}
