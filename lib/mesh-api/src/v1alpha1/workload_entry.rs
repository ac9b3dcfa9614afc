use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// WorkloadEntry registers a workload that does not run as a pod in this
/// cluster (a VM, a bare-metal host, a manually managed endpoint) so that it
/// joins the load-balancing membership of the services selecting its labels
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "mesh.datum.net",
    version = "v1alpha1",
    kind = "WorkloadEntry",
    plural = "workloadentries",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.service"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEntrySpec {
    /// Name of the service (in the entry's namespace) this workload is registered for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Routable address of the workload
    pub address: String,

    /// Workload labels, matched against service selectors
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Named ports exposed by the workload. Not read by the registry yet:
    /// foreign instances take their endpoint port from the service port.
    #[serde(default)]
    pub ports: BTreeMap<String, u32>,

    /// Service account the workload runs as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Network the workload belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Locality in region/zone/subzone form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
}

impl WorkloadEntrySpec {
    /// Whether the entry carries enough information to be selected by a service
    pub fn is_selectable(&self) -> bool {
        self.service.as_deref().is_some_and(|s| !s.is_empty())
            && !self.address.is_empty()
            && !self.labels.is_empty()
    }
}
