//! Datum mesh API types for Kubernetes integration
//!
//! This library defines the resources consumed by the service registry:
//! - WorkloadEntry: workloads registered from outside the cluster's pods (VMs, manual entries)
//! - MeshNetworks: the network topology document used for multi-network classification

pub mod v1alpha1;
pub mod networks;

pub use v1alpha1::WorkloadEntry;
pub use networks::{MeshNetworks, Network, NetworkEndpoint, NetworkGateway};
