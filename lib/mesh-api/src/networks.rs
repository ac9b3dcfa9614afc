//! Mesh network topology configuration
//!
//! Each named network lists where its endpoints come from: either a CIDR
//! range (`fromCidr`) or a whole registry/cluster (`fromRegistry`).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// MeshNetworks describes the logical networks of a multi-network mesh
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeshNetworks {
    /// Networks keyed by network name
    #[serde(default)]
    pub networks: BTreeMap<String, Network>,
}

impl MeshNetworks {
    /// Whether no network is configured
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// A single logical network
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Sources of endpoints belonging to this network
    #[serde(default)]
    pub endpoints: Vec<NetworkEndpoint>,

    /// Gateways through which the network is reached from other networks
    #[serde(default)]
    pub gateways: Vec<NetworkGateway>,
}

/// Source of endpoints for a network
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpoint {
    /// Endpoints whose address falls in this CIDR belong to the network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_cidr: Option<String>,

    /// Every endpoint discovered by this registry (cluster id) belongs to the network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_registry: Option<String>,
}

/// Gateway of a network
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkGateway {
    /// Fully qualified name of the gateway service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_service_name: Option<String>,

    /// Fixed gateway address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Gateway port
    #[serde(default)]
    pub port: u32,
}
