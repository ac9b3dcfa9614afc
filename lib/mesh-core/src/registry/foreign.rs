//! Instances contributed by foreign registries and instance lookups by port

use super::proxy::get_pod_services;
use super::Controller;
use crate::convert::service_hostname;
use crate::endpoint::Endpoint;
use crate::model::{Event, Labels, RegistryKind, Resolution, Service, ServiceInstance};
use crate::Result;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, warn};

impl Controller {
    /// Native instances of a service port plus matching foreign instances.
    /// When neither exists, falls back to the service's external-name
    /// instances in its own namespace.
    pub async fn instances_by_port(
        &self,
        svc: &Arc<Service>,
        port: u16,
        filter: &[Labels],
    ) -> Result<Vec<ServiceInstance>> {
        let mut out = self.endpoints.instances_by_port(self, svc, port, filter).await?;
        out.extend(self.foreign_service_instances_by_port(svc, port).await);
        if !out.is_empty() {
            return Ok(out);
        }

        let cache = self.cache.read().await;
        Ok(cache
            .external_name_instances
            .get(&svc.hostname)
            .into_iter()
            .flatten()
            .filter(|i| {
                i.service.namespace == svc.namespace && i.service_port.as_ref().is_some_and(|p| p.port == port)
            })
            .cloned()
            .collect())
    }

    /// Foreign instances selected by a native client-side load balanced
    /// service, bound to one of its ports.
    ///
    /// The endpoint port is the service port itself, not a resolved target
    /// port: foreign registrations carry no mapping between the two.
    pub(crate) async fn foreign_service_instances_by_port(&self, svc: &Arc<Service>, port: u16) -> Vec<ServiceInstance> {
        if svc.registry != RegistryKind::Kubernetes
            || svc.mesh_external
            || svc.resolution != Resolution::ClientSideLb
            || svc.label_selectors.is_empty()
        {
            return Vec::new();
        }
        let Some(service_port) = svc.ports.by_number(port) else {
            return Vec::new();
        };

        let cache = self.cache.read().await;
        let mut out: Vec<ServiceInstance> = cache
            .foreign_instances
            .values()
            .filter(|fi| fi.service.namespace == svc.namespace && svc.label_selectors.subset_of(&fi.endpoint.labels))
            .map(|fi| {
                let mut endpoint = fi.endpoint.clone();
                endpoint.endpoint_port = port;
                endpoint.service_port_name = service_port.name.clone();
                ServiceInstance {
                    service: svc.clone(),
                    service_port: Some(service_port.clone()),
                    endpoint,
                }
            })
            .collect();
        out.sort_by(|a, b| a.endpoint.address.cmp(&b.endpoint.address));
        out
    }

    /// Foreign endpoints of a service across every port: the instances of
    /// the first port, then a copy of each for every other port
    pub(crate) async fn collect_all_foreign_endpoints(&self, svc: &Arc<Service>) -> Vec<Endpoint> {
        if svc.resolution != Resolution::ClientSideLb {
            return Vec::new();
        }
        let Some(first) = svc.ports.first() else {
            return Vec::new();
        };

        let instances = self.foreign_service_instances_by_port(svc, first.port).await;
        let mut endpoints: Vec<Endpoint> = instances.iter().map(|i| i.endpoint.clone()).collect();
        for port in svc.ports.iter().skip(1) {
            for instance in &instances {
                let mut ep = instance.endpoint.clone();
                ep.endpoint_port = port.port;
                ep.service_port_name = port.name.clone();
                endpoints.push(ep);
            }
        }
        endpoints
    }

    /// Foreign instance registered at an address
    pub async fn foreign_instance(&self, address: &str) -> Option<ServiceInstance> {
        self.cache.read().await.foreign_instances.get(address).cloned()
    }

    /// Record an instance registered by another registry and push the new
    /// endpoint sets of the services selecting it
    pub async fn foreign_service_instance_handler(&self, si: ServiceInstance, event: Event) {
        // Without namespace or labels no service can select the instance
        if si.service.namespace.is_empty() || si.endpoint.labels.is_empty() {
            return;
        }

        {
            let mut cache = self.cache.write().await;
            match event {
                Event::Delete => {
                    cache.foreign_instances.remove(&si.endpoint.address);
                }
                Event::Add | Event::Update => {
                    cache.foreign_instances.insert(si.endpoint.address.clone(), si.clone());
                }
            }
        }

        let services = match get_pod_services(self.services.as_ref(), &si.service.namespace, &si.endpoint.labels) {
            Ok(services) => services,
            Err(e) => {
                warn!("Failed to list services for foreign instance {}: {}", si.endpoint.address, e);
                return;
            }
        };

        for k8s_svc in services {
            let hostname = service_hostname(
                &k8s_svc.name_any(),
                &k8s_svc.namespace().unwrap_or_default(),
                &self.options.domain_suffix,
            );
            let Some(service) = self.get_service(&hostname).await else {
                continue;
            };
            if service.resolution != Resolution::ClientSideLb {
                continue;
            }

            let mut endpoints = Vec::new();
            for port in service.ports.iter().filter(|p| !p.protocol.is_udp()) {
                match self.instances_by_port(&service, port.port, &[]).await {
                    Ok(instances) => endpoints.extend(instances.into_iter().map(|i| i.endpoint)),
                    Err(e) => debug!(
                        "Failed to get endpoints for service {} on port {}, in response to foreign instance: {}",
                        service.hostname, port.port, e
                    ),
                }
            }

            if let Err(e) = self.xds.eds_update(
                &self.options.cluster_id,
                service.hostname.as_str(),
                &service.namespace,
                endpoints,
            ) {
                warn!("EDS update for {} failed: {}", service.hostname, e);
            }
        }
    }
}
