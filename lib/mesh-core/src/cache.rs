//! Derived registry state
//!
//! [`RegistryCache`] holds every map derived from watch events. It carries no
//! lock of its own: the controller wraps it in a single reader/writer lock and
//! every method here runs inside that lock's scope, so multi-map updates are
//! atomic to readers.

use crate::model::{Hostname, Labels, Service, ServiceInstance};
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot of a node relevant to gateway addresses
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    /// First external IP of the node
    pub address: String,
    pub labels: Labels,
}

#[derive(Default)]
pub struct RegistryCache {
    pub(crate) services: HashMap<Hostname, Arc<Service>>,
    /// Selectors of node-port gateway services
    pub(crate) node_selectors: HashMap<Hostname, Labels>,
    pub(crate) external_name_instances: HashMap<Hostname, Vec<ServiceInstance>>,
    pub(crate) nodes: HashMap<String, NodeInfo>,
    /// Foreign instances by endpoint address
    pub(crate) foreign_instances: HashMap<String, ServiceInstance>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a service together with its gateway selector and external-name
    /// instances. Entries the service no longer has are dropped.
    pub fn commit_service(
        &mut self,
        service: Arc<Service>,
        node_selector: Option<Labels>,
        external_name_instances: Vec<ServiceInstance>,
    ) {
        let hostname = service.hostname.clone();

        match node_selector {
            Some(selector) => {
                self.node_selectors.insert(hostname.clone(), selector);
            }
            None => {
                self.node_selectors.remove(&hostname);
            }
        }

        if external_name_instances.is_empty() {
            self.external_name_instances.remove(&hostname);
        } else {
            self.external_name_instances
                .insert(hostname.clone(), external_name_instances);
        }

        self.services.insert(hostname, service);
    }

    /// Remove a service and everything derived from it
    pub fn remove_service(&mut self, hostname: &Hostname) -> Option<Arc<Service>> {
        self.node_selectors.remove(hostname);
        self.external_name_instances.remove(hostname);
        self.services.remove(hostname)
    }

    pub fn service(&self, hostname: &Hostname) -> Option<Arc<Service>> {
        self.services.get(hostname).cloned()
    }

    /// Node-port gateway services with their node selectors
    pub fn gateway_services(&self) -> Vec<(Arc<Service>, Labels)> {
        self.node_selectors
            .iter()
            .filter_map(|(hostname, selector)| {
                self.services
                    .get(hostname)
                    .map(|svc| (svc.clone(), selector.clone()))
            })
            .collect()
    }

    /// Store a node snapshot; true when it differs from the stored one
    pub fn upsert_node(&mut self, name: &str, info: NodeInfo) -> bool {
        if self.nodes.get(name) == Some(&info) {
            return false;
        }
        self.nodes.insert(name.to_string(), info);
        true
    }

    pub fn remove_node(&mut self, name: &str) {
        self.nodes.remove(name);
    }

    /// Sorted addresses of the nodes whose labels satisfy the selector; an
    /// empty selector takes every node
    pub fn node_addresses(&self, selector: &Labels) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .nodes
            .values()
            .filter(|node| selector.subset_of(&node.labels))
            .map(|node| node.address.clone())
            .collect();
        addresses.sort();
        addresses
    }
}
