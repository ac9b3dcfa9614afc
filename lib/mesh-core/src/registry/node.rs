use super::Controller;
use crate::cache::NodeInfo;
use crate::model::{Event, Labels};
use crate::Result;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::debug;

/// First non-empty external IP of a node
fn external_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "ExternalIP" && !a.address.is_empty())
        .map(|a| a.address.clone())
}

impl Controller {
    pub(crate) async fn on_node_event(&self, node: &Node, event: Event) -> Result<()> {
        let name = node.name_any();

        let update_needed = match event {
            Event::Delete => {
                self.cache.write().await.remove_node(&name);
                true
            }
            Event::Add | Event::Update => {
                let Some(address) = external_ip(node) else {
                    return Ok(());
                };
                let info = NodeInfo {
                    address,
                    labels: Labels::from(node.metadata.labels.as_ref()),
                };
                // Resyncs replay identical nodes
                self.cache.write().await.upsert_node(&name, info)
            }
        };

        if update_needed && self.update_service_external_addr().await {
            debug!("Node {} changed, requesting full push", name);
            self.xds.config_update(true);
        }
        Ok(())
    }

    /// Recompute the external addresses of every node-port gateway service.
    /// Returns false when there is none.
    pub(crate) async fn update_service_external_addr(&self) -> bool {
        let cache = self.cache.read().await;
        let gateways = cache.gateway_services();
        if gateways.is_empty() {
            return false;
        }
        for (svc, selector) in gateways {
            svc.set_external_addresses(&self.options.cluster_id, cache.node_addresses(&selector));
        }
        true
    }
}
