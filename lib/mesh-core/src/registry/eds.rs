use super::Controller;
use crate::convert::service_hostname;
use crate::endpoints::EndpointSnapshot;
use crate::model::{Event, ServiceInstance};
use tracing::{debug, error, info, warn};

impl Controller {
    /// Rebuild the endpoint set of the service owning a snapshot and push it
    pub(crate) async fn update_eds(&self, snapshot: &EndpointSnapshot, event: Event) {
        let hostname = service_hostname(&snapshot.name, &snapshot.namespace, &self.options.domain_suffix);
        let Some(svc) = self.get_service(&hostname).await else {
            info!(
                "Handle EDS endpoints: skip updating, service {}/{} has not been populated",
                snapshot.name, snapshot.namespace
            );
            return;
        };

        let mut endpoints = Vec::new();
        if event != Event::Delete {
            for subset in &snapshot.subsets {
                for address in &subset.addresses {
                    // Endpoints may arrive before their pod
                    let Some(pod) = self.pod_for_address(address).await else {
                        self.metrics.endpoints_with_no_pods.inc();
                        error!(
                            "Endpoint without pod {} {}.{}",
                            address.ip, snapshot.name, snapshot.namespace
                        );
                        continue;
                    };
                    let builder = self.endpoint_builder(&pod).await;
                    for port in &subset.ports {
                        endpoints.push(builder.build(&address.ip, port.port, &port.name));
                    }
                }
            }
        }

        debug!(
            "Handle EDS: {} endpoints for {} in namespace {}",
            endpoints.len(),
            snapshot.name,
            snapshot.namespace
        );

        let mut merged = endpoints.clone();
        merged.extend(self.collect_all_foreign_endpoints(&svc).await);
        if let Err(e) = self
            .xds
            .eds_update(&self.options.cluster_id, hostname.as_str(), &snapshot.namespace, merged)
        {
            warn!("EDS update for {} failed: {}", hostname, e);
        }

        let instances: Vec<ServiceInstance> = endpoints
            .into_iter()
            .map(|endpoint| ServiceInstance {
                service: svc.clone(),
                service_port: svc.ports.get(&endpoint.service_port_name).cloned(),
                endpoint,
            })
            .collect();
        self.notify_instances(&instances, event);
    }
}
