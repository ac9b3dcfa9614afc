//! Fixtures shared by the unit tests

use crate::convert::NODE_SELECTOR_ANNOTATION;
use crate::endpoint::Endpoint;
use crate::locality::NodeLookup;
use crate::model::{Event, Hostname, Labels, Service, ServiceInstance};
use crate::options::Options;
use crate::queue::Watched;
use crate::registry::{Controller, Dependencies};
use crate::store::{HasSynced, ObjectStore};
use crate::xds::XdsUpdater;
use crate::{CoreError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, NodeAddress,
    NodeStatus, ObjectReference, Pod, PodSpec, PodStatus, Service as KubeService, ServicePort, ServiceSpec,
};
use k8s_openapi::api::discovery::v1::{
    Endpoint as SliceEndpoint, EndpointConditions, EndpointPort as SlicePort, EndpointSlice,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::watcher;
use kube::Resource;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

pub const CLUSTER_IP: &str = "10.96.0.10";

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
        ..Default::default()
    }
}

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Name the endpoint fixtures reference for an address
fn pod_name_for(ip: &str) -> String {
    format!("pod-{}", ip.replace('.', "-"))
}

fn pod_ref(namespace: &str, ip: &str) -> ObjectReference {
    ObjectReference {
        kind: Some("Pod".to_string()),
        name: Some(pod_name_for(ip)),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// ClusterIP service with numeric target ports
pub fn service(namespace: &str, name: &str, selector: &[(&str, &str)], ports: &[(&str, i32, i32)]) -> KubeService {
    KubeService {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            cluster_ip: Some(CLUSTER_IP.to_string()),
            selector: Some(map(selector)),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port, target)| ServicePort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*target)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP service whose ports target named container ports
pub fn service_with_targets(
    namespace: &str,
    name: &str,
    selector: &[(&str, &str)],
    ports: &[(&str, i32, &str)],
) -> KubeService {
    let mut svc = service(namespace, name, selector, &[]);
    if let Some(spec) = svc.spec.as_mut() {
        spec.ports = Some(
            ports
                .iter()
                .map(|(port_name, port, target)| ServicePort {
                    name: Some(port_name.to_string()),
                    port: *port,
                    target_port: Some(IntOrString::String(target.to_string())),
                    ..Default::default()
                })
                .collect(),
        );
    }
    svc
}

pub fn external_name_service(namespace: &str, name: &str, external: &str, ports: &[(&str, i32)]) -> KubeService {
    KubeService {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(external.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// NodePort gateway service. Without a selector the annotation is empty and
/// every node is selected.
pub fn gateway_service(namespace: &str, name: &str, selector: Option<&str>) -> KubeService {
    let mut svc = service(namespace, name, &[("app", "ingress-gateway")], &[("http2", 80, 8080)]);
    svc.metadata.annotations = Some(map(&[(NODE_SELECTOR_ANNOTATION, selector.unwrap_or(""))]));
    if let Some(spec) = svc.spec.as_mut() {
        spec.type_ = Some("NodePort".to_string());
    }
    svc
}

/// Running pod scheduled on a node
pub fn pod(namespace: &str, name: &str, ip: &str, labels: &[(&str, &str)], node_name: &str) -> Pod {
    let mut metadata = meta(namespace, name);
    metadata.labels = Some(map(labels));
    Pod {
        metadata,
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
    }
}

/// Running pod with one container declaring the given ports
pub fn pod_with_ports(namespace: &str, name: &str, ip: &str, ports: &[(&str, i32, &str)]) -> Pod {
    let mut p = pod(namespace, name, ip, &[], "");
    p.spec = Some(PodSpec {
        containers: vec![Container {
            name: "app".to_string(),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port, protocol)| ContainerPort {
                        name: Some(port_name.to_string()),
                        container_port: *port,
                        protocol: Some(protocol.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }],
        ..Default::default()
    });
    p
}

pub fn node(name: &str, external_ip: &str, labels: &[(&str, &str)]) -> Node {
    let mut metadata = meta("", name);
    metadata.labels = Some(map(labels));
    Node {
        metadata,
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "ExternalIP".to_string(),
                address: external_ip.to_string(),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Endpoints with one ready subset; every address references `pod-<ip>`
pub fn endpoints(namespace: &str, name: &str, ips: &[&str], ports: &[(&str, i32)]) -> Endpoints {
    Endpoints {
        metadata: meta(namespace, name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        target_ref: Some(pod_ref(namespace, ip)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| EndpointPort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

pub fn endpoint_slice(
    namespace: &str,
    name: &str,
    service: &str,
    addresses: &[(&str, bool)],
    ports: &[(&str, i32)],
) -> EndpointSlice {
    let mut metadata = meta(namespace, name);
    metadata.labels = Some(map(&[(crate::endpoints::SERVICE_NAME_LABEL, service)]));
    EndpointSlice {
        metadata,
        address_type: "IPv4".to_string(),
        endpoints: addresses
            .iter()
            .map(|(ip, ready)| SliceEndpoint {
                addresses: vec![ip.to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(*ready),
                    ..Default::default()
                }),
                target_ref: Some(pod_ref(namespace, ip)),
                ..Default::default()
            })
            .collect(),
        ports: Some(
            ports
                .iter()
                .map(|(port_name, port)| SlicePort {
                    name: Some(port_name.to_string()),
                    port: Some(*port),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

/// Instance registered by a foreign registry
pub fn foreign_instance(namespace: &str, ip: &str, labels: &[(&str, &str)]) -> ServiceInstance {
    let hostname = Hostname::new(format!("vm.{}.svc.cluster.local", namespace));
    ServiceInstance {
        service: Arc::new(Service::new(hostname, "vm", namespace)),
        service_port: None,
        endpoint: Endpoint {
            address: ip.to_string(),
            labels: labels.iter().copied().collect::<Labels>(),
            ..Default::default()
        },
    }
}

/// Node labels split between the local cache and the API server
#[derive(Default)]
pub struct StaticNodeLookup {
    cached: Mutex<HashMap<String, BTreeMap<String, String>>>,
    remote: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl StaticNodeLookup {
    pub fn cache(&self, name: &str, labels: &[(&str, &str)]) {
        self.cached.lock().unwrap().insert(name.to_string(), map(labels));
    }

    pub fn remote(&self, name: &str, labels: &[(&str, &str)]) {
        self.remote.lock().unwrap().insert(name.to_string(), map(labels));
    }
}

#[async_trait]
impl NodeLookup for StaticNodeLookup {
    fn cached_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.cached.lock().unwrap().get(name).cloned()
    }

    async fn fetch_labels(&self, name: &str) -> Result<BTreeMap<String, String>> {
        self.remote
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::Internal(format!("node {} not found", name)))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum XdsCall {
    Svc(String, String, Event),
    Eds(String, Vec<Endpoint>),
    Config(bool),
}

/// Records every push in order
#[derive(Default)]
pub struct FakeXdsUpdater {
    calls: Mutex<Vec<XdsCall>>,
}

impl FakeXdsUpdater {
    pub fn calls(&self) -> Vec<XdsCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl XdsUpdater for FakeXdsUpdater {
    fn svc_update(&self, _cluster_id: &str, name: &str, namespace: &str, event: Event) {
        self.calls
            .lock()
            .unwrap()
            .push(XdsCall::Svc(name.to_string(), namespace.to_string(), event));
    }

    fn eds_update(&self, _cluster_id: &str, hostname: &str, _namespace: &str, endpoints: Vec<Endpoint>) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(XdsCall::Eds(hostname.to_string(), endpoints));
        Ok(())
    }

    fn config_update(&self, full: bool) {
        self.calls.lock().unwrap().push(XdsCall::Config(full));
    }
}

/// Reflector store that has completed its initial listing of `objects`
pub fn listed<K>(objects: Vec<K>) -> Store<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    let (reader, mut writer) = reflector::store();
    apply_listing(&mut writer, objects);
    reader
}

fn apply_listing<K>(writer: &mut Writer<K>, objects: Vec<K>)
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer.apply_watcher_event(&watcher::Event::Init);
    for obj in objects {
        writer.apply_watcher_event(&watcher::Event::InitApply(obj));
    }
    writer.apply_watcher_event(&watcher::Event::InitDone);
}

/// Synced reflector store written directly by tests
pub struct TestStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    reader: Store<K>,
    writer: Mutex<Writer<K>>,
}

impl<K> TestStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new() -> Self {
        let (reader, mut writer) = reflector::store();
        apply_listing(&mut writer, Vec::new());
        Self {
            reader,
            writer: Mutex::new(writer),
        }
    }

    pub fn apply(&self, obj: K) {
        self.writer
            .lock()
            .unwrap()
            .apply_watcher_event(&watcher::Event::Apply(obj));
    }

    pub fn reader(&self) -> Store<K> {
        self.reader.clone()
    }

    pub fn objects(&self) -> ObjectStore<K> {
        ObjectStore::from(self.reader())
    }
}

/// Synced controller wired to in-memory stores and a recording push sink
pub struct Harness {
    pub controller: Controller,
    pub xds: Arc<FakeXdsUpdater>,
    pub services: TestStore<KubeService>,
    pub pods: TestStore<Pod>,
    pub nodes: Arc<StaticNodeLookup>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let xds = Arc::new(FakeXdsUpdater::default());
        let services = TestStore::new();
        let pods = TestStore::new();
        let nodes = Arc::new(StaticNodeLookup::default());

        let controller = Controller::new(
            options,
            Dependencies {
                xds: xds.clone(),
                services: Arc::new(services.objects()),
                nodes: nodes.clone(),
                pods: pods.objects(),
                networks_watcher: None,
                sync_sources: vec![
                    Arc::new(services.reader()) as Arc<dyn HasSynced>,
                    Arc::new(pods.reader()),
                ],
            },
        )
        .expect("controller");

        Self {
            controller,
            xds,
            services,
            pods,
            nodes,
        }
    }

    pub async fn add_service(&self, svc: KubeService) {
        self.services.apply(svc.clone());
        self.controller
            .on_service_event(&svc, Event::Add)
            .await
            .expect("service event");
    }

    pub async fn add_pod(&self, pod: Pod) {
        self.pods.apply(pod.clone());
        self.controller.pods.on_event(&pod, Event::Add).await;
    }

    pub async fn apply_endpoints(&self, obj: impl Watched, event: Event) {
        self.controller
            .on_endpoint_event(&obj.into_object(), event)
            .await
            .expect("endpoint event");
    }
}
