//! WorkloadEntry resources registered as foreign service instances

use async_trait::async_trait;
use kube::ResourceExt;
use mesh_api::WorkloadEntry;
use mesh_core::builder::{pod_uid, spiffe_identity};
use mesh_core::convert::service_hostname;
use mesh_core::endpoint::Locality;
use mesh_core::model::RegistryKind;
use mesh_core::queue::WatchHandler;
use mesh_core::{Controller, Endpoint, Event, Labels, Options, Service, ServiceInstance};
use std::sync::Arc;
use tracing::{debug, warn};

/// Instance registered by a workload entry, or `None` when the entry lacks
/// an owning service, an address or labels. The network is resolved by the
/// caller when the entry does not name one.
pub fn workload_instance(entry: &WorkloadEntry, options: &Options, network: String) -> Option<ServiceInstance> {
    let name = entry.name_any();
    let namespace = entry.namespace().unwrap_or_default();
    let spec = &entry.spec;
    if !spec.is_selectable() {
        return None;
    }
    let service_name = spec.service.clone()?;

    let mut service = Service::new(
        service_hostname(&service_name, &namespace, &options.domain_suffix),
        &service_name,
        &namespace,
    );
    service.registry = RegistryKind::External;

    Some(ServiceInstance {
        service: Arc::new(service),
        service_port: None,
        endpoint: Endpoint {
            address: spec.address.clone(),
            labels: Labels::from(spec.labels.clone()),
            service_account: spec
                .service_account
                .as_deref()
                .filter(|sa| !sa.is_empty())
                .map(|sa| spiffe_identity(&options.trust_domain, &namespace, sa))
                .unwrap_or_default(),
            network: spec.network.clone().unwrap_or(network),
            locality: Locality {
                label: spec.locality.clone().unwrap_or_default(),
                cluster_id: options.cluster_id.clone(),
            },
            uid: pod_uid(&name, &namespace),
            ..Default::default()
        },
    })
}

/// Feeds workload entries to the registry's foreign instance handler
pub struct ForeignRegistrar {
    controller: Arc<Controller>,
}

impl ForeignRegistrar {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    async fn register(&self, entry: &WorkloadEntry, event: Event) {
        let network = self.controller.endpoint_network(&entry.spec.address);
        let Some(instance) = workload_instance(entry, self.controller.options(), network) else {
            warn!(
                "WorkloadEntry {}/{} is missing a service, address or labels, skipping",
                entry.namespace().unwrap_or_default(),
                entry.name_any()
            );
            return;
        };
        debug!(
            "WorkloadEntry {}/{} {} at {}",
            entry.namespace().unwrap_or_default(),
            entry.name_any(),
            event,
            instance.endpoint.address
        );
        self.controller.foreign_service_instance_handler(instance, event).await;
    }
}

#[async_trait]
impl WatchHandler<WorkloadEntry> for ForeignRegistrar {
    async fn on_add(&self, obj: WorkloadEntry) {
        self.register(&obj, Event::Add).await;
    }

    async fn on_update(&self, old: &WorkloadEntry, new: WorkloadEntry) {
        if old.spec == new.spec {
            return;
        }
        // Instances are keyed by address
        if old.spec.address != new.spec.address {
            self.register(old, Event::Delete).await;
        }
        self.register(&new, Event::Update).await;
    }

    async fn on_delete(&self, obj: WorkloadEntry) {
        self.register(&obj, Event::Delete).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Pod, Service as KubeService};
    use kube_runtime::reflector::{self, Store};
    use kube_runtime::watcher;
    use mesh_api::v1alpha1::WorkloadEntrySpec;
    use mesh_core::locality::NodeLookup;
    use mesh_core::store::ObjectStore;
    use mesh_core::{Dependencies, XdsUpdater};
    use std::collections::BTreeMap;

    struct NoopXds;

    impl XdsUpdater for NoopXds {
        fn svc_update(&self, _cluster_id: &str, _name: &str, _namespace: &str, _event: Event) {}

        fn eds_update(
            &self,
            _cluster_id: &str,
            _hostname: &str,
            _namespace: &str,
            _endpoints: Vec<Endpoint>,
        ) -> mesh_core::Result<()> {
            Ok(())
        }

        fn config_update(&self, _full: bool) {}
    }

    struct NoNodes;

    #[async_trait]
    impl NodeLookup for NoNodes {
        fn cached_labels(&self, _name: &str) -> Option<BTreeMap<String, String>> {
            None
        }

        async fn fetch_labels(&self, name: &str) -> mesh_core::Result<BTreeMap<String, String>> {
            Err(mesh_core::CoreError::Internal(format!("node {} not found", name)))
        }
    }

    fn empty_store<K>() -> Store<K>
    where
        K: kube::Resource + Clone + 'static,
        K::DynamicType: Eq + std::hash::Hash + Clone + Default,
    {
        let (reader, mut writer) = reflector::store();
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitDone);
        reader
    }

    fn registrar() -> (ForeignRegistrar, Arc<Controller>) {
        let controller = Arc::new(
            Controller::new(
                Options::default(),
                Dependencies {
                    xds: Arc::new(NoopXds),
                    services: Arc::new(ObjectStore::from(empty_store::<KubeService>())),
                    nodes: Arc::new(NoNodes),
                    pods: ObjectStore::from(empty_store::<Pod>()),
                    networks_watcher: None,
                    sync_sources: Vec::new(),
                },
            )
            .expect("controller"),
        );
        (ForeignRegistrar::new(controller.clone()), controller)
    }

    fn entry(spec: WorkloadEntrySpec) -> WorkloadEntry {
        let mut entry = WorkloadEntry::new("vm-1", spec);
        entry.metadata.namespace = Some("default".to_string());
        entry
    }

    fn reviews_entry(address: &str, version: &str) -> WorkloadEntry {
        entry(WorkloadEntrySpec {
            service: Some("reviews".to_string()),
            address: address.to_string(),
            labels: BTreeMap::from([
                ("app".to_string(), "reviews".to_string()),
                ("version".to_string(), version.to_string()),
            ]),
            ..Default::default()
        })
    }

    #[test]
    fn test_workload_instance() {
        let entry = entry(WorkloadEntrySpec {
            service: Some("reviews".to_string()),
            address: "10.10.0.4".to_string(),
            labels: BTreeMap::from([("app".to_string(), "reviews".to_string())]),
            service_account: Some("bookinfo".to_string()),
            locality: Some("us-east/a/".to_string()),
            ..Default::default()
        });

        let si = workload_instance(&entry, &Options::default(), "net1".to_string()).expect("instance");
        assert_eq!(si.service.hostname.as_str(), "reviews.default.svc.cluster.local");
        assert_eq!(si.service.namespace, "default");
        assert_eq!(si.endpoint.address, "10.10.0.4");
        assert_eq!(si.endpoint.labels.get("app"), Some("reviews"));
        assert_eq!(
            si.endpoint.service_account,
            "spiffe://cluster.local/ns/default/sa/bookinfo"
        );
        assert_eq!(si.endpoint.network, "net1");
        assert_eq!(si.endpoint.locality.label, "us-east/a/");
        assert_eq!(si.endpoint.locality.cluster_id, "Kubernetes");
        assert_eq!(si.endpoint.uid, "kubernetes://vm-1.default");
    }

    #[test]
    fn test_declared_network_wins() {
        let entry = entry(WorkloadEntrySpec {
            service: Some("ratings".to_string()),
            address: "10.10.0.5".to_string(),
            labels: BTreeMap::from([("app".to_string(), "ratings".to_string())]),
            network: Some("vm-net".to_string()),
            ..Default::default()
        });
        let si = workload_instance(&entry, &Options::default(), "net1".to_string()).expect("instance");
        assert_eq!(si.endpoint.network, "vm-net");
        assert_eq!(si.service.name, "ratings");
        assert!(si.endpoint.service_account.is_empty());
    }

    #[test]
    fn test_entry_without_service_skipped() {
        let entry = entry(WorkloadEntrySpec {
            address: "10.10.0.6".to_string(),
            labels: BTreeMap::from([("app".to_string(), "vm".to_string())]),
            ..Default::default()
        });
        assert!(workload_instance(&entry, &Options::default(), String::new()).is_none());
    }

    #[test]
    fn test_entry_without_labels_skipped() {
        let entry = entry(WorkloadEntrySpec {
            service: Some("reviews".to_string()),
            address: "10.10.0.7".to_string(),
            ..Default::default()
        });
        assert!(workload_instance(&entry, &Options::default(), String::new()).is_none());
    }

    #[tokio::test]
    async fn test_registrar_ignores_unlabelled_entry() {
        let (registrar, controller) = registrar();
        let unlabelled = entry(WorkloadEntrySpec {
            service: Some("reviews".to_string()),
            address: "10.10.0.7".to_string(),
            ..Default::default()
        });

        registrar.on_add(unlabelled).await;
        assert!(controller.foreign_instance("10.10.0.7").await.is_none());
    }

    #[tokio::test]
    async fn test_address_change_replaces_instance() {
        let (registrar, controller) = registrar();
        let old = reviews_entry("10.10.0.4", "v1");
        registrar.on_add(old.clone()).await;
        assert!(controller.foreign_instance("10.10.0.4").await.is_some());

        registrar.on_update(&old, reviews_entry("10.10.0.5", "v1")).await;
        assert!(controller.foreign_instance("10.10.0.4").await.is_none());
        let moved = controller.foreign_instance("10.10.0.5").await.expect("new address registered");
        assert_eq!(moved.endpoint.labels.get("app"), Some("reviews"));
    }

    #[tokio::test]
    async fn test_update_in_place_and_delete() {
        let (registrar, controller) = registrar();
        let v1 = reviews_entry("10.10.0.4", "v1");
        registrar.on_add(v1.clone()).await;

        let v2 = reviews_entry("10.10.0.4", "v2");
        registrar.on_update(&v1, v2.clone()).await;
        let updated = controller.foreign_instance("10.10.0.4").await.expect("still registered");
        assert_eq!(updated.endpoint.labels.get("version"), Some("v2"));

        registrar.on_delete(v2).await;
        assert!(controller.foreign_instance("10.10.0.4").await.is_none());
    }
}
