//! Registry configuration

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Source of endpoint information
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointMode {
    /// core/v1 Endpoints
    #[default]
    EndpointsOnly,
    /// discovery/v1 EndpointSlices
    EndpointSliceOnly,
}

/// Configurable attributes of a registry controller
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Namespaces to watch; empty means all namespaces
    pub watched_namespaces: Vec<String>,

    /// DNS suffix of service hostnames
    pub domain_suffix: String,

    /// Identifies this cluster in a multi-cluster mesh
    pub cluster_id: String,

    /// Trust domain of SPIFFE identities
    pub trust_domain: String,

    /// Which endpoint resource to read
    pub endpoint_mode: EndpointMode,

    /// Delay before a failed ingestion task is retried (seconds)
    pub retry_delay_seconds: u64,

    /// YAML file holding the mesh networks configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_networks_file: Option<PathBuf>,

    /// Interval between mesh networks file checks (seconds)
    pub mesh_networks_poll_seconds: u64,

    /// Watch node metadata only for locality lookups instead of full node objects
    pub node_metadata_only: bool,

    /// Label selector limiting the nodes watched for gateway addresses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_node_selector: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            watched_namespaces: Vec::new(),
            domain_suffix: "cluster.local".to_string(),
            cluster_id: "Kubernetes".to_string(),
            trust_domain: "cluster.local".to_string(),
            endpoint_mode: EndpointMode::default(),
            retry_delay_seconds: 1,
            mesh_networks_file: None,
            mesh_networks_poll_seconds: 10,
            node_metadata_only: true,
            gateway_node_selector: None,
        }
    }
}

impl Options {
    /// Load options from a YAML file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let options: Self = serde_yaml::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    /// Reject settings the registry cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.is_empty() {
            return Err(CoreError::InvalidConfiguration("clusterId must not be empty".to_string()));
        }
        if self.domain_suffix.is_empty() {
            return Err(CoreError::InvalidConfiguration("domainSuffix must not be empty".to_string()));
        }
        if self.mesh_networks_poll_seconds == 0 {
            return Err(CoreError::InvalidConfiguration(
                "meshNetworksPollSeconds must be positive".to_string(),
            ));
        }
        if self.gateway_node_selector.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(CoreError::InvalidConfiguration(
                "gatewayNodeSelector must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn mesh_networks_poll_interval(&self) -> Duration {
        Duration::from_secs(self.mesh_networks_poll_seconds)
    }
}
