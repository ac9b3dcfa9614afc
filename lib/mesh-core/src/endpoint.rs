//! Endpoint management
use crate::model::Labels;
use serde::{Deserialize, Serialize};

/// A single network-reachable destination with its identity, locality and
/// network metadata. Always freshly built; never shared between calls.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub address: String,
    pub endpoint_port: u16,
    /// Name of the service port this endpoint serves
    pub service_port_name: String,
    pub labels: Labels,
    /// SPIFFE identity of the workload
    pub service_account: String,
    pub network: String,
    pub locality: Locality,
    /// Workload UID, e.g. `kubernetes://reviews-v1-abc.default`
    pub uid: String,
}

/// Topological placement of an endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locality {
    /// `region/zone/subzone`, empty when unknown
    pub label: String,
    pub cluster_id: String,
}
