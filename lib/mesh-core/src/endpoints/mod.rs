//! Endpoint sources
//!
//! Native endpoint information comes from either core/v1 Endpoints or
//! discovery/v1 EndpointSlices. Both are normalised into per-service
//! [`EndpointSnapshot`]s; instance construction on top of the snapshots is
//! shared by the two sources.

mod slice;
mod v1;

pub use slice::{EndpointSliceSource, SERVICE_NAME_LABEL};
pub use v1::EndpointsSource;

use crate::convert::service_hostname;
use crate::model::{filter_matches, Event, Labels, Proxy, Service, ServiceInstance};
use crate::options::EndpointMode;
use crate::queue::WatchObject;
use crate::registry::Controller;
use crate::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use std::sync::Arc;
use tracing::debug;

/// Pod referenced by an endpoint address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl PodRef {
    /// Only references of kind `Pod` are kept
    pub fn from_object_reference(target: Option<&ObjectReference>) -> Option<Self> {
        let target = target?;
        if target.kind.as_deref() != Some("Pod") {
            return None;
        }
        Some(Self {
            name: target.name.clone()?,
            namespace: target.namespace.clone().unwrap_or_default(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    pub ip: String,
    pub target: Option<PodRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointPort {
    /// Service port name; may be empty when the service has a single port
    pub name: String,
    pub port: u16,
    pub protocol: Option<String>,
}

/// Addresses sharing one set of ports
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSubset {
    /// Ready addresses
    pub addresses: Vec<EndpointAddress>,
    pub not_ready: Vec<String>,
    pub ports: Vec<EndpointPort>,
}

impl EndpointSubset {
    fn hosts(&self, ip: &str) -> bool {
        self.addresses.iter().any(|a| a.ip == ip) || self.not_ready.iter().any(|a| a == ip)
    }
}

/// Endpoints of one service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSnapshot {
    /// Service name
    pub name: String,
    pub namespace: String,
    pub subsets: Vec<EndpointSubset>,
}

/// Strategy over the two endpoint resource kinds
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Ingest a raw endpoint object. Returns the resulting snapshot of the
    /// owning service and the event to apply to it, or `None` when the
    /// object is not of this source's kind.
    fn apply(&self, object: &WatchObject, event: Event) -> Option<(EndpointSnapshot, Event)>;

    fn snapshot(&self, namespace: &str, name: &str) -> Option<EndpointSnapshot>;

    fn snapshots(&self) -> Vec<EndpointSnapshot>;

    /// Native instances of a service port whose pod labels match the filter
    async fn instances_by_port(
        &self,
        c: &Controller,
        svc: &Arc<Service>,
        port: u16,
        filter: &[Labels],
    ) -> Result<Vec<ServiceInstance>> {
        let Some(svc_port) = svc.ports.by_number(port) else {
            return Ok(Vec::new());
        };
        let Some(snapshot) = self.snapshot(&svc.namespace, &svc.name) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for subset in &snapshot.subsets {
            for address in &subset.addresses {
                let Some(pod) = c.pod_for_address(address).await else {
                    debug!("No pod for endpoint {} of service {}", address.ip, svc.hostname);
                    continue;
                };
                if !filter_matches(filter, &Labels::from(pod.metadata.labels.as_ref())) {
                    continue;
                }
                let builder = c.endpoint_builder(&pod).await;
                for ep_port in &subset.ports {
                    if ep_port.name.is_empty() || ep_port.name == svc_port.name {
                        out.push(ServiceInstance {
                            service: svc.clone(),
                            service_port: Some(svc_port.clone()),
                            endpoint: builder.build(&address.ip, ep_port.port, &svc_port.name),
                        });
                    }
                }
            }
        }
        Ok(out)
    }

    /// Instances of services whose endpoints list one of the proxy's
    /// addresses, used for services without a selector
    async fn get_proxy_service_instances(
        &self,
        c: &Controller,
        proxy: &Proxy,
        pod: &Pod,
    ) -> Vec<ServiceInstance> {
        let builder = c.endpoint_builder(pod).await;
        let mut out = Vec::new();

        for snapshot in self.snapshots() {
            let hostname = service_hostname(&snapshot.name, &snapshot.namespace, &c.options().domain_suffix);
            let Some(svc) = c.get_service(&hostname).await else {
                continue;
            };
            for subset in &snapshot.subsets {
                for ep_port in &subset.ports {
                    let Some(svc_port) = svc.ports.get(&ep_port.name) else {
                        continue;
                    };
                    for ip in proxy.ip_addresses.iter().filter(|ip| subset.hosts(ip)) {
                        out.push(ServiceInstance {
                            service: svc.clone(),
                            service_port: Some(svc_port.clone()),
                            endpoint: builder.build(ip, ep_port.port, &svc_port.name),
                        });
                    }
                }
            }
        }
        out
    }
}

/// Source for the configured endpoint mode
pub fn new_endpoint_source(mode: EndpointMode) -> Box<dyn EndpointSource> {
    match mode {
        EndpointMode::EndpointsOnly => Box::new(EndpointsSource::new()),
        EndpointMode::EndpointSliceOnly => Box::new(EndpointSliceSource::new()),
    }
}
