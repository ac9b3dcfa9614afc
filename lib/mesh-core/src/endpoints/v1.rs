use super::{EndpointAddress, EndpointPort, EndpointSnapshot, EndpointSource, EndpointSubset, PodRef};
use crate::model::Event;
use crate::queue::WatchObject;
use crate::store::object_key;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Endpoints;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Endpoint source over core/v1 Endpoints
#[derive(Default)]
pub struct EndpointsSource {
    snapshots: RwLock<HashMap<String, EndpointSnapshot>>,
}

impl EndpointsSource {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_snapshot(ep: &Endpoints) -> EndpointSnapshot {
    let subsets = ep
        .subsets
        .iter()
        .flatten()
        .map(|subset| EndpointSubset {
            addresses: subset
                .addresses
                .iter()
                .flatten()
                .map(|a| EndpointAddress {
                    ip: a.ip.clone(),
                    target: PodRef::from_object_reference(a.target_ref.as_ref()),
                })
                .collect(),
            not_ready: subset
                .not_ready_addresses
                .iter()
                .flatten()
                .map(|a| a.ip.clone())
                .collect(),
            ports: subset
                .ports
                .iter()
                .flatten()
                .filter_map(|p| {
                    Some(EndpointPort {
                        name: p.name.clone().unwrap_or_default(),
                        port: u16::try_from(p.port).ok()?,
                        protocol: p.protocol.clone(),
                    })
                })
                .collect(),
        })
        .collect();

    EndpointSnapshot {
        name: ep.name_any(),
        namespace: ep.namespace().unwrap_or_default(),
        subsets,
    }
}

#[async_trait]
impl EndpointSource for EndpointsSource {
    fn apply(&self, object: &WatchObject, event: Event) -> Option<(EndpointSnapshot, Event)> {
        let WatchObject::Endpoints(ep) = object else {
            return None;
        };
        let snapshot = to_snapshot(ep);
        let key = object_key(&snapshot.namespace, &snapshot.name);

        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        if event == Event::Delete {
            snapshots.remove(&key);
        } else {
            snapshots.insert(key, snapshot.clone());
        }
        Some((snapshot, event))
    }

    fn snapshot(&self, namespace: &str, name: &str) -> Option<EndpointSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&object_key(namespace, name))
            .cloned()
    }

    fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
