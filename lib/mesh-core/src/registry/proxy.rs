//! Proxy to service instance resolution

use super::Controller;
use crate::convert::service_hostname;
use crate::endpoint::{Endpoint, Locality};
use crate::model::{Labels, PodPort, Port, Protocol, Proxy, Resolution, ServiceInstance};
use crate::store::ServiceLister;
use crate::{CoreError, Result};
use k8s_openapi::api::core::v1::{Pod, Service as KubeService, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Services of a namespace whose selector matches the labels. Services
/// without a selector match nothing.
pub(crate) fn get_pod_services(
    lister: &dyn ServiceLister,
    namespace: &str,
    labels: &Labels,
) -> Result<Vec<Arc<KubeService>>> {
    Ok(lister
        .list(namespace)?
        .into_iter()
        .filter(|svc| {
            svc.spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .is_some_and(|selector| Labels::from(selector.clone()).subset_of(labels))
        })
        .collect())
}

/// Container port a service port targets on a pod. Named targets must match
/// a container port of the same name and protocol.
pub fn find_port(pod: &Pod, svc_port: &ServicePort) -> Result<u16> {
    let target = match &svc_port.target_port {
        None => return to_port(svc_port.port),
        Some(IntOrString::Int(port)) => return to_port(*port),
        Some(IntOrString::String(name)) => name,
    };
    let protocol = svc_port.protocol.as_deref().unwrap_or("TCP");

    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(target.as_str()) && p.protocol.as_deref().unwrap_or("TCP") == protocol)
        .map(|p| to_port(p.container_port))
        .unwrap_or_else(|| {
            Err(CoreError::PortNotFound(format!(
                "no port {} in pod {}",
                target,
                pod.name_any()
            )))
        })
}

/// Container port a service port targets, resolved against the ports a
/// proxy reported
pub fn find_port_from_metadata(svc_port: &ServicePort, pod_ports: &[PodPort]) -> Result<u16> {
    match &svc_port.target_port {
        None => to_port(svc_port.port),
        Some(IntOrString::Int(port)) => to_port(*port),
        Some(IntOrString::String(name)) => pod_ports
            .iter()
            .find(|p| &p.name == name)
            .map(|p| p.container_port)
            .ok_or_else(|| CoreError::PortNotFound(format!("no matching port found for {}", name))),
    }
}

fn to_port(port: i32) -> Result<u16> {
    u16::try_from(port).map_err(|_| CoreError::PortNotFound(format!("port {} out of range", port)))
}

/// Distinct (target port, protocol) pairs in declaration order, each with
/// the first service port resolving to it
fn dedupe_targets(targets: &mut Vec<((u16, Protocol), Port)>, target: u16, svc_port: &Port) {
    let key = (target, svc_port.protocol);
    if !targets.iter().any(|(k, _)| *k == key) {
        targets.push((key, svc_port.clone()));
    }
}

impl Controller {
    /// Service instances co-located with a proxy
    pub async fn get_proxy_service_instances(&self, proxy: &Proxy) -> Vec<ServiceInstance> {
        let mut out = Vec::new();

        if let Some(proxy_ip) = proxy.ip_addresses.first() {
            let foreign = self.cache.read().await.foreign_instances.get(proxy_ip).cloned();

            if let Some(foreign) = foreign {
                match self.hydrate_foreign_service_instance(&foreign).await {
                    Ok(instances) => out = instances,
                    Err(e) => warn!("Failed to hydrate foreign instances for proxy {}: {}", proxy.id, e),
                }
            } else if let Some(pod) = self.pods.get_pod_by_ip(proxy_ip).await {
                // The same pod address may exist in another cluster's network
                if proxy.metadata.network != self.endpoint_network(proxy_ip) {
                    return out;
                }
                let labels = Labels::from(pod.metadata.labels.as_ref());
                let namespace = pod.namespace().unwrap_or_default();
                match get_pod_services(self.services.as_ref(), &namespace, &labels) {
                    Ok(services) if !services.is_empty() => {
                        for svc in services {
                            out.extend(self.get_proxy_service_instances_by_pod(&pod, &svc, proxy).await);
                        }
                    }
                    _ => out = self.endpoints.get_proxy_service_instances(self, proxy, &pod).await,
                }
            } else {
                match self.get_proxy_service_instances_from_metadata(proxy).await {
                    Ok(instances) => out = instances,
                    Err(e) => warn!("Failed to build instances from metadata of proxy {}: {}", proxy.id, e),
                }
            }
        }

        if out.is_empty() {
            self.metrics.proxy_no_service.inc();
            info!("Empty list of services for proxy {}", proxy.id);
        }
        out
    }

    /// Instances of the client-side load balanced services selecting a
    /// foreign workload, across all non-UDP ports
    pub(crate) async fn hydrate_foreign_service_instance(&self, si: &ServiceInstance) -> Result<Vec<ServiceInstance>> {
        let mut out = Vec::new();
        let services = get_pod_services(self.services.as_ref(), &si.service.namespace, &si.endpoint.labels)?;

        for k8s_svc in services {
            let hostname = service_hostname(
                &k8s_svc.name_any(),
                &k8s_svc.namespace().unwrap_or_default(),
                &self.options.domain_suffix,
            );
            let Some(service) = self.get_service(&hostname).await else {
                continue;
            };
            // Headless services have no load-balanced endpoints
            if service.resolution != Resolution::ClientSideLb {
                continue;
            }
            for port in service.ports.iter().filter(|p| !p.protocol.is_udp()) {
                out.extend(self.instances_by_port(&service, port.port, &[]).await?);
            }
        }
        Ok(out)
    }

    async fn get_proxy_service_instances_by_pod(
        &self,
        pod: &Pod,
        k8s_svc: &KubeService,
        proxy: &Proxy,
    ) -> Vec<ServiceInstance> {
        let namespace = k8s_svc.namespace().unwrap_or_default();
        let hostname = service_hostname(&k8s_svc.name_any(), &namespace, &self.options.domain_suffix);
        let Some(svc) = self.get_service(&hostname).await else {
            return Vec::new();
        };

        let mut targets = Vec::new();
        for port in k8s_svc.spec.iter().flat_map(|s| s.ports.iter().flatten()) {
            let Some(svc_port) = svc.ports.get(port.name.as_deref().unwrap_or_default()) else {
                continue;
            };
            match find_port(pod, port) {
                Ok(target) => dedupe_targets(&mut targets, target, svc_port),
                Err(e) => warn!(
                    "Failed to find port for service {}/{}: {}",
                    namespace,
                    k8s_svc.name_any(),
                    e
                ),
            }
        }

        let builder = self.endpoint_builder(pod).await;
        let mut out = Vec::new();
        for ((target, _), svc_port) in targets {
            for ip in &proxy.ip_addresses {
                out.push(ServiceInstance {
                    service: svc.clone(),
                    endpoint: builder.build(ip, target, &svc_port.name),
                    service_port: Some(svc_port.clone()),
                });
            }
        }
        out
    }

    /// Instances rebuilt from what the proxy reports about its workload,
    /// for proxies whose pod has not been seen yet
    pub(crate) async fn get_proxy_service_instances_from_metadata(
        &self,
        proxy: &Proxy,
    ) -> Result<Vec<ServiceInstance>> {
        let metadata = &proxy.metadata;
        if metadata.labels.is_empty() {
            return Err(CoreError::ProxyMetadata("no workload labels found".to_string()));
        }
        if metadata.cluster_id != self.options.cluster_id {
            return Err(CoreError::ProxyMetadata(format!(
                "proxy is in cluster {}, but controller is for cluster {}",
                metadata.cluster_id, self.options.cluster_id
            )));
        }

        let services = get_pod_services(self.services.as_ref(), &proxy.config_namespace, &metadata.labels)
            .map_err(|e| CoreError::ProxyMetadata(format!("error getting instances for {}: {}", proxy.id, e)))?;
        if services.is_empty() {
            return Err(CoreError::ProxyMetadata(format!("no instances found for {}", proxy.id)));
        }

        let locality = Locality {
            label: proxy.locality.as_ref().map(|l| l.to_label()).unwrap_or_default(),
            cluster_id: self.options.cluster_id.clone(),
        };

        let mut out = Vec::new();
        for k8s_svc in services {
            let hostname = service_hostname(
                &k8s_svc.name_any(),
                &k8s_svc.namespace().unwrap_or_default(),
                &self.options.domain_suffix,
            );
            let service = self
                .get_service(&hostname)
                .await
                .ok_or_else(|| CoreError::ProxyMetadata(format!("failed to find model service for {}", hostname)))?;

            let mut targets = Vec::new();
            for port in k8s_svc.spec.iter().flat_map(|s| s.ports.iter().flatten()) {
                let name = port.name.as_deref().unwrap_or_default();
                let svc_port = service
                    .ports
                    .get(name)
                    .ok_or_else(|| CoreError::ProxyMetadata(format!("failed to get svc port for {}", name)))?;
                let target = find_port_from_metadata(port, &metadata.pod_ports).map_err(|e| {
                    CoreError::ProxyMetadata(format!("failed to find target port for {}: {}", proxy.id, e))
                })?;
                dedupe_targets(&mut targets, target, svc_port);
            }

            for ((target, _), svc_port) in targets {
                for ip in &proxy.ip_addresses {
                    out.push(ServiceInstance {
                        service: service.clone(),
                        endpoint: Endpoint {
                            address: ip.clone(),
                            endpoint_port: target,
                            service_port_name: svc_port.name.clone(),
                            labels: metadata.labels.clone(),
                            service_account: metadata.service_account.clone(),
                            network: self.endpoint_network(ip),
                            locality: locality.clone(),
                            uid: String::new(),
                        },
                        service_port: Some(svc_port.clone()),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Labels of the workload behind a proxy; empty when its pod is unknown
    pub async fn get_proxy_workload_labels(&self, proxy: &Proxy) -> Vec<Labels> {
        let Some(ip) = proxy.ip_addresses.first() else {
            return Vec::new();
        };
        match self.pods.get_pod_by_ip(ip).await {
            Some(pod) => vec![Labels::from(pod.metadata.labels.as_ref())],
            None => Vec::new(),
        }
    }

    /// Sorted identities allowed to run a service: its declared accounts
    /// plus those of every instance on the given ports
    pub async fn get_service_accounts(&self, service: &Arc<crate::model::Service>, ports: &[u16]) -> Vec<String> {
        let mut accounts: BTreeSet<String> = service.service_accounts.iter().cloned().collect();
        for port in ports {
            match self.instances_by_port(service, *port, &[]).await {
                Ok(instances) => accounts.extend(
                    instances
                        .into_iter()
                        .map(|i| i.endpoint.service_account)
                        .filter(|sa| !sa.is_empty()),
                ),
                Err(e) => warn!("Failed to get instances of {} on port {}: {}", service.hostname, port, e),
            }
        }
        accounts.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, PodPort, ProxyMetadata};
    use crate::testing;

    fn proxy(ip: &str, network: &str) -> Proxy {
        Proxy {
            id: format!("sidecar~{}", ip),
            ip_addresses: vec![ip.to_string()],
            config_namespace: "default".to_string(),
            metadata: ProxyMetadata {
                network: network.to_string(),
                cluster_id: "Kubernetes".to_string(),
                ..Default::default()
            },
            locality: None,
        }
    }

    #[test]
    fn test_find_port_by_name_and_protocol() {
        let pod = testing::pod_with_ports("default", "p", "10.0.0.1", &[("http", 8080, "TCP"), ("dns", 53, "UDP")]);
        let by_name = ServicePort {
            port: 80,
            target_port: Some(IntOrString::String("http".to_string())),
            ..Default::default()
        };
        assert_eq!(find_port(&pod, &by_name).unwrap(), 8080);

        let wrong_protocol = ServicePort {
            port: 53,
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::String("dns".to_string())),
            ..Default::default()
        };
        assert!(find_port(&pod, &wrong_protocol).is_err());

        let numeric = ServicePort {
            port: 80,
            target_port: Some(IntOrString::Int(9090)),
            ..Default::default()
        };
        assert_eq!(find_port(&pod, &numeric).unwrap(), 9090);
    }

    #[test]
    fn test_find_port_from_metadata() {
        let ports = vec![PodPort {
            name: "http".to_string(),
            container_port: 8080,
            protocol: "TCP".to_string(),
        }];
        let named = ServicePort {
            port: 80,
            target_port: Some(IntOrString::String("http".to_string())),
            ..Default::default()
        };
        assert_eq!(find_port_from_metadata(&named, &ports).unwrap(), 8080);

        let missing = ServicePort {
            port: 80,
            target_port: Some(IntOrString::String("grpc".to_string())),
            ..Default::default()
        };
        assert!(find_port_from_metadata(&missing, &ports).is_err());
    }

    #[tokio::test]
    async fn test_nil_selector_matches_no_pods() {
        let harness = testing::Harness::new();
        let mut svc = testing::service("default", "no-selector", &[], &[("http", 80, 8080)]);
        svc.spec.as_mut().unwrap().selector = None;
        harness.services.apply(svc);

        let labels: Labels = [("app", "reviews")].into_iter().collect();
        let matched = get_pod_services(&harness.services.objects(), "default", &labels).unwrap();
        assert!(matched.is_empty());
    }

    #[tokio::test]
    async fn test_pod_tier_dedupes_target_ports() {
        let harness = testing::Harness::new();
        let c = &harness.controller;
        let raw = testing::service_with_targets(
            "default",
            "reviews",
            &[("app", "reviews")],
            &[("http", 80, "web"), ("http-alt", 8000, "web")],
        );
        harness.add_service(raw).await;

        let mut pod = testing::pod_with_ports("default", "reviews-v1", "10.0.0.1", &[("web", 8080, "TCP")]);
        pod.metadata.labels = Some([("app".to_string(), "reviews".to_string())].into_iter().collect());
        harness.add_pod(pod).await;

        let instances = c.get_proxy_service_instances(&proxy("10.0.0.1", "")).await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].endpoint.endpoint_port, 8080);
        assert_eq!(instances[0].service_port.as_ref().unwrap().name, "http");
        assert_eq!(instances[0].endpoint.uid, "kubernetes://reviews-v1.default");
    }

    #[tokio::test]
    async fn test_network_mismatch_returns_empty() {
        let harness = testing::Harness::new();
        let c = &harness.controller;
        harness
            .add_service(testing::service("default", "reviews", &[("app", "reviews")], &[("http", 80, 8080)]))
            .await;
        harness
            .add_pod(testing::pod("default", "reviews-v1", "10.0.0.1", &[("app", "reviews")], "node-1"))
            .await;

        assert!(c.get_proxy_service_instances(&proxy("10.0.0.1", "other-net")).await.is_empty());
        assert_eq!(c.get_proxy_service_instances(&proxy("10.0.0.1", "")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_headless_fallback_without_selecting_service() {
        let harness = testing::Harness::new();
        let c = &harness.controller;
        let mut raw = testing::service("default", "db", &[], &[("tcp", 5432, 5432)]);
        raw.spec.as_mut().unwrap().selector = None;
        raw.spec.as_mut().unwrap().cluster_ip = Some("None".to_string());
        harness.add_service(raw).await;
        harness
            .add_pod(testing::pod("default", "db-0", "10.0.0.9", &[("app", "db")], "node-1"))
            .await;
        harness
            .apply_endpoints(testing::endpoints("default", "db", &["10.0.0.9"], &[("tcp", 5432)]), Event::Add)
            .await;

        let instances = c.get_proxy_service_instances(&proxy("10.0.0.9", "")).await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].service.name, "db");
        assert_eq!(instances[0].endpoint.endpoint_port, 5432);
    }

    #[tokio::test]
    async fn test_metadata_tier() {
        let harness = testing::Harness::new();
        let c = &harness.controller;
        harness
            .add_service(testing::service_with_targets(
                "default",
                "reviews",
                &[("app", "reviews")],
                &[("http", 80, "web")],
            ))
            .await;

        let mut p = proxy("10.0.0.3", "");
        p.ip_addresses.push("fd00::3".to_string());
        p.metadata.labels = [("app", "reviews"), ("version", "v2")].into_iter().collect();
        p.metadata.service_account = "spiffe://cluster.local/ns/default/sa/reviews".to_string();
        p.metadata.pod_ports = vec![PodPort {
            name: "web".to_string(),
            container_port: 9080,
            protocol: "TCP".to_string(),
        }];

        let instances = c.get_proxy_service_instances(&p).await;
        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|i| i.endpoint.endpoint_port == 9080));
        assert_eq!(instances[1].endpoint.address, "fd00::3");
        assert_eq!(instances[0].endpoint.service_account, p.metadata.service_account);

        p.metadata.cluster_id = "elsewhere".to_string();
        assert!(c.get_proxy_service_instances(&p).await.is_empty());
        assert_eq!(c.metrics().proxy_no_service.get(), 1);
    }

    #[tokio::test]
    async fn test_foreign_registration_takes_precedence() {
        let harness = testing::Harness::new();
        let c = &harness.controller;
        harness
            .add_service(testing::service("default", "reviews", &[("app", "reviews")], &[("http", 80, 8080)]))
            .await;
        harness
            .add_pod(testing::pod("default", "reviews-v1", "10.0.0.1", &[("app", "reviews")], "node-1"))
            .await;
        c.foreign_service_instance_handler(
            testing::foreign_instance("default", "10.0.0.1", &[("app", "reviews")]),
            Event::Add,
        )
        .await;

        let instances = c.get_proxy_service_instances(&proxy("10.0.0.1", "")).await;
        assert_eq!(instances.len(), 1);
        // Foreign instances carry the service port and no pod identity
        assert_eq!(instances[0].endpoint.endpoint_port, 80);
        assert!(instances[0].endpoint.uid.is_empty());
    }

    #[tokio::test]
    async fn test_workload_labels_and_service_accounts() {
        let harness = testing::Harness::new();
        let c = &harness.controller;
        harness
            .add_service(testing::service("default", "reviews", &[("app", "reviews")], &[("http", 80, 8080)]))
            .await;
        let mut pod = testing::pod("default", "reviews-v1", "10.0.0.1", &[("app", "reviews")], "node-1");
        pod.spec.as_mut().unwrap().service_account_name = Some("reviews".to_string());
        harness.add_pod(pod).await;
        harness
            .apply_endpoints(
                testing::endpoints("default", "reviews", &["10.0.0.1"], &[("http", 8080)]),
                Event::Add,
            )
            .await;

        let labels = c.get_proxy_workload_labels(&proxy("10.0.0.1", "")).await;
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].get("app"), Some("reviews"));
        assert!(c.get_proxy_workload_labels(&proxy("10.9.9.9", "")).await.is_empty());

        let svc = c.services().await.remove(0);
        assert_eq!(
            c.get_service_accounts(&svc, &[80]).await,
            vec!["spiffe://cluster.local/ns/default/sa/reviews".to_string()]
        );
    }
}
