//! Canonical service model
//!
//! These are the registry's own types. Raw Kubernetes objects are converted
//! into them (see [`crate::convert`]) before they are cached or returned.

use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Globally unique name of a service, e.g. `reviews.default.svc.cluster.local`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hostname(String);

impl Hostname {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self(hostname.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Hostname {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A set of key/value labels
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// True when every label of `self` is present with the same value in `other`.
    /// An empty set is a subset of everything.
    pub fn subset_of(&self, other: &Labels) -> bool {
        self.0.iter().all(|(k, v)| other.0.get(k) == Some(v))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for Labels {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl From<Option<&BTreeMap<String, String>>> for Labels {
    fn from(map: Option<&BTreeMap<String, String>>) -> Self {
        map.cloned().map(Self).unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Whether `labels` satisfies any selector of a query label filter.
/// An empty filter matches everything.
pub fn filter_matches(filter: &[Labels], labels: &Labels) -> bool {
    filter.is_empty() || filter.iter().any(|selector| selector.subset_of(labels))
}

/// Application protocol of a service port
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Http,
    Http2,
    Https,
    Grpc,
    Tcp,
    Tls,
    Udp,
    Unsupported,
}

impl Protocol {
    /// Infer the protocol of a Kubernetes port from its transport protocol
    /// and its name prefix (`http-web` -> HTTP)
    pub fn from_kube(transport: Option<&str>, port_name: &str) -> Self {
        if transport.is_some_and(|p| p.eq_ignore_ascii_case("UDP")) {
            return Protocol::Udp;
        }
        let prefix = port_name.split('-').next().unwrap_or_default();
        match prefix.to_ascii_lowercase().as_str() {
            "http" => Protocol::Http,
            "http2" => Protocol::Http2,
            "https" => Protocol::Https,
            "grpc" => Protocol::Grpc,
            "tcp" => Protocol::Tcp,
            "tls" => Protocol::Tls,
            _ => Protocol::Unsupported,
        }
    }

    pub fn is_udp(self) -> bool {
        self == Protocol::Udp
    }
}

/// A named service port
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// Ordered list of service ports
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortList(Vec<Port>);

impl PortList {
    pub fn new(ports: Vec<Port>) -> Self {
        Self(ports)
    }

    /// Look up a port by name
    pub fn get(&self, name: &str) -> Option<&Port> {
        self.0.iter().find(|p| p.name == name)
    }

    /// Look up a port by number
    pub fn by_number(&self, port: u16) -> Option<&Port> {
        self.0.iter().find(|p| p.port == port)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Port> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&Port> {
        self.0.first()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a PortList {
    type Item = &'a Port;
    type IntoIter = std::slice::Iter<'a, Port>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// How callers reach the endpoints of a service
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Callers load-balance across the individually enumerated endpoints
    #[default]
    ClientSideLb,
    /// Callers resolve a DNS name
    DnsLb,
    /// Traffic goes straight to the original destination (headless services)
    Passthrough,
}

/// Registry a service was discovered by
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryKind {
    #[default]
    Kubernetes,
    External,
}

/// Canonical service
#[derive(Debug)]
pub struct Service {
    pub hostname: Hostname,
    pub name: String,
    pub namespace: String,
    pub registry: RegistryKind,
    /// Virtual address of the service, `0.0.0.0` when it has none
    pub address: String,
    pub ports: PortList,
    pub label_selectors: Labels,
    pub resolution: Resolution,
    pub mesh_external: bool,
    pub service_accounts: Vec<String>,
    pub external_name: Option<String>,
    /// External addresses keyed by cluster id. Guarded separately from the
    /// registry lock so address refreshes of many services do not contend.
    cluster_external_addresses: Mutex<BTreeMap<String, Vec<String>>>,
}

impl Service {
    pub fn new(hostname: Hostname, name: &str, namespace: &str) -> Self {
        Self {
            hostname,
            name: name.to_string(),
            namespace: namespace.to_string(),
            registry: RegistryKind::Kubernetes,
            address: "0.0.0.0".to_string(),
            ports: PortList::default(),
            label_selectors: Labels::default(),
            resolution: Resolution::ClientSideLb,
            mesh_external: false,
            service_accounts: Vec::new(),
            external_name: None,
            cluster_external_addresses: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of the external addresses of every cluster
    pub fn cluster_external_addresses(&self) -> BTreeMap<String, Vec<String>> {
        self.cluster_external_addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// External addresses contributed by one cluster
    pub fn external_addresses(&self, cluster_id: &str) -> Vec<String> {
        self.cluster_external_addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the external addresses contributed by one cluster, leaving
    /// other clusters' entries untouched
    pub fn set_external_addresses(&self, cluster_id: &str, addresses: Vec<String>) {
        self.cluster_external_addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cluster_id.to_string(), addresses);
    }
}

impl Clone for Service {
    fn clone(&self) -> Self {
        Self {
            hostname: self.hostname.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            registry: self.registry,
            address: self.address.clone(),
            ports: self.ports.clone(),
            label_selectors: self.label_selectors.clone(),
            resolution: self.resolution,
            mesh_external: self.mesh_external,
            service_accounts: self.service_accounts.clone(),
            external_name: self.external_name.clone(),
            cluster_external_addresses: Mutex::new(self.cluster_external_addresses()),
        }
    }
}

/// One routable destination of a service port.
///
/// `service_port` is only absent for instance-listener notifications whose
/// endpoint port name is not declared on the service.
#[derive(Clone, Debug)]
pub struct ServiceInstance {
    pub service: Arc<Service>,
    pub service_port: Option<Port>,
    pub endpoint: Endpoint,
}

/// Kind of change carried by a watch event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    Add,
    Update,
    Delete,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Event::Add => "add",
            Event::Update => "update",
            Event::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A container port reported by a proxy in its metadata
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodPort {
    pub name: String,
    pub container_port: u16,
    pub protocol: String,
}

/// Locality reported by a proxy
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyLocality {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

impl ProxyLocality {
    /// Render as `region[/zone[/subzone]]`, stopping at the first empty part
    pub fn to_label(&self) -> String {
        let mut label = self.region.clone();
        if self.zone.is_empty() {
            return label;
        }
        label.push('/');
        label.push_str(&self.zone);
        if self.sub_zone.is_empty() {
            return label;
        }
        label.push('/');
        label.push_str(&self.sub_zone);
        label
    }
}

/// Metadata a proxy reports about its workload
#[derive(Clone, Debug, Default)]
pub struct ProxyMetadata {
    pub network: String,
    pub cluster_id: String,
    pub labels: Labels,
    pub service_account: String,
    pub pod_ports: Vec<PodPort>,
}

/// A connected proxy asking for the instances it fronts
#[derive(Clone, Debug, Default)]
pub struct Proxy {
    pub id: String,
    pub ip_addresses: Vec<String>,
    pub config_namespace: String,
    pub metadata: ProxyMetadata,
    pub locality: Option<ProxyLocality>,
}
