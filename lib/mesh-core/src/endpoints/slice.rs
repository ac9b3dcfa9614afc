use super::{EndpointAddress, EndpointPort, EndpointSnapshot, EndpointSource, EndpointSubset, PodRef};
use crate::model::Event;
use crate::queue::WatchObject;
use crate::store::object_key;
use async_trait::async_trait;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Label linking a slice to its service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

struct SliceEntry {
    service: String,
    namespace: String,
    subset: EndpointSubset,
}

/// Endpoint source over discovery/v1 EndpointSlices. A service may own
/// several slices; its snapshot has one subset per slice.
#[derive(Default)]
pub struct EndpointSliceSource {
    /// Slices by slice key, ordered so snapshots are deterministic
    slices: RwLock<BTreeMap<String, SliceEntry>>,
}

impl EndpointSliceSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn aggregate(slices: &BTreeMap<String, SliceEntry>, namespace: &str, name: &str) -> Option<EndpointSnapshot> {
        let subsets: Vec<EndpointSubset> = slices
            .values()
            .filter(|e| e.namespace == namespace && e.service == name)
            .map(|e| e.subset.clone())
            .collect();
        if subsets.is_empty() {
            return None;
        }
        Some(EndpointSnapshot {
            name: name.to_string(),
            namespace: namespace.to_string(),
            subsets,
        })
    }
}

fn to_subset(slice: &EndpointSlice) -> EndpointSubset {
    let mut subset = EndpointSubset::default();
    for ep in &slice.endpoints {
        // Absent readiness means ready
        let ready = ep.conditions.as_ref().and_then(|c| c.ready).unwrap_or(true);
        let target = PodRef::from_object_reference(ep.target_ref.as_ref());
        for ip in &ep.addresses {
            if ready {
                subset.addresses.push(EndpointAddress {
                    ip: ip.clone(),
                    target: target.clone(),
                });
            } else {
                subset.not_ready.push(ip.clone());
            }
        }
    }
    subset.ports = slice
        .ports
        .iter()
        .flatten()
        .filter_map(|p| {
            Some(EndpointPort {
                name: p.name.clone().unwrap_or_default(),
                port: u16::try_from(p.port?).ok()?,
                protocol: p.protocol.clone(),
            })
        })
        .collect();
    subset
}

#[async_trait]
impl EndpointSource for EndpointSliceSource {
    fn apply(&self, object: &WatchObject, event: Event) -> Option<(EndpointSnapshot, Event)> {
        let WatchObject::EndpointSlice(slice) = object else {
            return None;
        };
        let namespace = slice.namespace().unwrap_or_default();
        let Some(service) = slice.labels().get(SERVICE_NAME_LABEL).cloned() else {
            debug!("EndpointSlice {} has no service name label", slice.name_any());
            return None;
        };
        let key = object_key(&namespace, &slice.name_any());

        let mut slices = self.slices.write().unwrap_or_else(PoisonError::into_inner);
        if event == Event::Delete {
            slices.remove(&key);
        } else {
            slices.insert(
                key,
                SliceEntry {
                    service: service.clone(),
                    namespace: namespace.clone(),
                    subset: to_subset(slice),
                },
            );
        }

        match Self::aggregate(&slices, &namespace, &service) {
            // Other slices of the service remain
            Some(snapshot) if event == Event::Delete => Some((snapshot, Event::Update)),
            Some(snapshot) => Some((snapshot, event)),
            None => Some((
                EndpointSnapshot {
                    name: service,
                    namespace,
                    subsets: Vec::new(),
                },
                Event::Delete,
            )),
        }
    }

    fn snapshot(&self, namespace: &str, name: &str) -> Option<EndpointSnapshot> {
        let slices = self.slices.read().unwrap_or_else(PoisonError::into_inner);
        Self::aggregate(&slices, namespace, name)
    }

    fn snapshots(&self) -> Vec<EndpointSnapshot> {
        let slices = self.slices.read().unwrap_or_else(PoisonError::into_inner);
        let services: BTreeSet<(String, String)> = slices
            .values()
            .map(|e| (e.namespace.clone(), e.service.clone()))
            .collect();
        services
            .into_iter()
            .filter_map(|(namespace, name)| Self::aggregate(&slices, &namespace, &name))
            .collect()
    }
}
