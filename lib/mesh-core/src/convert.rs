//! Conversion of raw Kubernetes services into the canonical model

use crate::endpoint::Endpoint;
use crate::model::{Hostname, Labels, Port, PortList, Protocol, Resolution, Service, ServiceInstance};
use k8s_openapi::api::core::v1::Service as KubeService;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Annotation holding the JSON node selector of a node-port gateway service
pub const NODE_SELECTOR_ANNOTATION: &str = "mesh.datum.net/node-selector";

/// Annotation listing extra service accounts allowed to run a service
pub const SERVICE_ACCOUNTS_ANNOTATION: &str = "mesh.datum.net/canonical-serviceaccounts";

const CLUSTER_IP_NONE: &str = "None";

/// `<name>.<namespace>.svc.<domain-suffix>`
pub fn service_hostname(name: &str, namespace: &str, domain_suffix: &str) -> Hostname {
    Hostname::new(format!("{}.{}.svc.{}", name, namespace, domain_suffix))
}

/// Build the canonical service for a raw service object
pub fn convert_service(svc: &KubeService, domain_suffix: &str, cluster_id: &str) -> Service {
    let name = svc.name_any();
    let namespace = svc.namespace().unwrap_or_default();
    let mut service = Service::new(service_hostname(&name, &namespace, domain_suffix), &name, &namespace);

    let Some(spec) = svc.spec.as_ref() else {
        return service;
    };

    service.ports = PortList::new(
        spec.ports
            .iter()
            .flatten()
            .filter_map(|p| {
                let port = u16::try_from(p.port).ok()?;
                let name = p.name.clone().unwrap_or_default();
                Some(Port {
                    protocol: Protocol::from_kube(p.protocol.as_deref(), &name),
                    name,
                    port,
                })
            })
            .collect(),
    );
    service.label_selectors = Labels::from(spec.selector.as_ref());

    match spec.cluster_ip.as_deref() {
        Some(CLUSTER_IP_NONE) => service.resolution = Resolution::Passthrough,
        Some(ip) if !ip.is_empty() => service.address = ip.to_string(),
        _ => {}
    }

    if spec.type_.as_deref() == Some("ExternalName") {
        if let Some(external) = spec.external_name.as_ref().filter(|n| !n.is_empty()) {
            service.mesh_external = true;
            service.resolution = Resolution::DnsLb;
            service.external_name = Some(external.clone());
        }
    }

    if let Some(accounts) = svc.annotations().get(SERVICE_ACCOUNTS_ANNOTATION) {
        service.service_accounts = accounts
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
    }

    if spec.type_.as_deref() == Some("LoadBalancer") {
        let addresses: Vec<String> = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
            .collect();
        if !addresses.is_empty() {
            service.set_external_addresses(cluster_id, addresses);
        }
    }

    service
}

/// Pseudo-instances of an ExternalName service, one per declared port
pub fn external_name_service_instances(service: &Arc<Service>) -> Vec<ServiceInstance> {
    let Some(external) = service.external_name.as_ref() else {
        return Vec::new();
    };
    service
        .ports
        .iter()
        .map(|port| ServiceInstance {
            service: service.clone(),
            service_port: Some(port.clone()),
            endpoint: Endpoint {
                address: external.clone(),
                endpoint_port: port.port,
                service_port_name: port.name.clone(),
                ..Default::default()
            },
        })
        .collect()
}

/// Whether a service exposes node addresses as a node-port gateway
pub fn is_node_port_gateway_service(svc: &KubeService) -> bool {
    svc.annotations().contains_key(NODE_SELECTOR_ANNOTATION)
        && svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("NodePort")
}

/// Node selector of a gateway service. Absent or unparsable selectors
/// select every node.
pub fn node_selector_for_service(svc: &KubeService) -> Labels {
    let Some(raw) = svc.annotations().get(NODE_SELECTOR_ANNOTATION).filter(|v| !v.is_empty()) else {
        return Labels::new();
    };
    match serde_json::from_str::<BTreeMap<String, String>>(raw) {
        Ok(selector) => Labels::from(selector),
        Err(e) => {
            debug!(
                "failed to unmarshal node selector annotation value for service {}.{}: {}",
                svc.name_any(),
                svc.namespace().unwrap_or_default(),
                e
            );
            Labels::new()
        }
    }
}
