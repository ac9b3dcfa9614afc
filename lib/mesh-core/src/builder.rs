//! Construction of endpoints for pod-backed workloads

use crate::endpoint::{Endpoint, Locality};
use crate::model::Labels;
use crate::network::NetworkClassifier;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;

/// SPIFFE identity of a service account
pub fn spiffe_identity(trust_domain: &str, namespace: &str, service_account: &str) -> String {
    format!("spiffe://{}/ns/{}/sa/{}", trust_domain, namespace, service_account)
}

/// Workload UID of a pod
pub fn pod_uid(name: &str, namespace: &str) -> String {
    format!("kubernetes://{}.{}", name, namespace)
}

/// Builds endpoints sharing the identity of one pod
pub struct EndpointBuilder {
    labels: Labels,
    service_account: String,
    locality: Locality,
    uid: String,
    networks: Arc<NetworkClassifier>,
}

impl EndpointBuilder {
    pub fn new(pod: &Pod, locality: Locality, trust_domain: &str, networks: Arc<NetworkClassifier>) -> Self {
        let namespace = pod.namespace().unwrap_or_default();
        let service_account = pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.as_deref())
            .filter(|sa| !sa.is_empty())
            .map(|sa| spiffe_identity(trust_domain, &namespace, sa))
            .unwrap_or_default();

        Self {
            labels: Labels::from(pod.metadata.labels.as_ref()),
            service_account,
            locality,
            uid: pod_uid(&pod.name_any(), &namespace),
            networks,
        }
    }

    pub fn build(&self, address: &str, port: u16, service_port_name: &str) -> Endpoint {
        Endpoint {
            address: address.to_string(),
            endpoint_port: port,
            service_port_name: service_port_name.to_string(),
            labels: self.labels.clone(),
            service_account: self.service_account.clone(),
            network: self.networks.classify(address),
            locality: self.locality.clone(),
            uid: self.uid.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use mesh_api::{MeshNetworks, Network, NetworkEndpoint};
    use prometheus::IntCounter;

    #[test]
    fn test_build_from_pod() {
        let networks = Arc::new(NetworkClassifier::new(IntCounter::new("a", "a").unwrap()));
        let mut config = MeshNetworks::default();
        config.networks.insert(
            "net1".to_string(),
            Network {
                endpoints: vec![NetworkEndpoint {
                    from_cidr: Some("10.0.0.0/24".to_string()),
                    from_registry: None,
                }],
                gateways: vec![],
            },
        );
        networks.rebuild(Some(&config), "Kubernetes");

        let mut pod = testing::pod("default", "reviews-v1", "10.0.0.7", &[("app", "reviews")], "node-1");
        pod.spec.as_mut().unwrap().service_account_name = Some("bookinfo".to_string());
        let locality = Locality {
            label: "us-west/a/".to_string(),
            cluster_id: "Kubernetes".to_string(),
        };

        let builder = EndpointBuilder::new(&pod, locality.clone(), "cluster.local", networks);
        let ep = builder.build("10.0.0.7", 9080, "http");

        assert_eq!(ep.service_account, "spiffe://cluster.local/ns/default/sa/bookinfo");
        assert_eq!(ep.uid, "kubernetes://reviews-v1.default");
        assert_eq!(ep.network, "net1");
        assert_eq!(ep.locality, locality);
        assert_eq!(ep.labels.get("app"), Some("reviews"));
        assert_eq!(ep.endpoint_port, 9080);
    }
}
