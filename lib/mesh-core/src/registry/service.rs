use super::Controller;
use crate::convert::{
    convert_service, external_name_service_instances, is_node_port_gateway_service, node_selector_for_service,
};
use crate::model::Event;
use crate::Result;
use k8s_openapi::api::core::v1::Service as KubeService;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::debug;

impl Controller {
    pub(crate) async fn on_service_event(&self, svc: &KubeService, event: Event) -> Result<()> {
        let name = svc.name_any();
        let namespace = svc.namespace().unwrap_or_default();
        debug!("Handle event {} for service {} in namespace {}", event, name, namespace);

        let service = Arc::new(convert_service(svc, &self.options.domain_suffix, &self.options.cluster_id));

        match event {
            Event::Delete => {
                self.cache.write().await.remove_service(&service.hostname);
            }
            Event::Add | Event::Update => {
                let instances = external_name_service_instances(&service);

                let node_selector = is_node_port_gateway_service(svc).then(|| node_selector_for_service(svc));
                if let Some(selector) = &node_selector {
                    let addresses = self.cache.read().await.node_addresses(selector);
                    service.set_external_addresses(&self.options.cluster_id, addresses);
                }

                self.cache
                    .write()
                    .await
                    .commit_service(service.clone(), node_selector, instances);
            }
        }

        self.xds.svc_update(&self.options.cluster_id, &name, &namespace, event);
        self.notify_service(&service, event);
        Ok(())
    }
}
