//! Multi-network classification of endpoint addresses
//!
//! The mesh networks document maps CIDR ranges (and whole registries) to
//! network names. Every configuration change rebuilds a fresh table which is
//! swapped in whole, so readers see either the old or the new table.

use ipnetwork::IpNetwork;
use mesh_api::MeshNetworks;
use prometheus::IntCounter;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Callback invoked with the new configuration after each change
pub type NetworksHandler = Box<dyn Fn(&MeshNetworks) + Send + Sync>;

/// Source of the mesh networks configuration
pub trait NetworksWatcher: Send + Sync {
    /// Current configuration, if any has been loaded
    fn networks(&self) -> Option<MeshNetworks>;

    fn add_networks_handler(&self, handler: NetworksHandler);
}

#[derive(Debug, Default)]
struct NetworkTable {
    /// Network assigned to every endpoint of this registry
    registry_network: Option<String>,
    /// Ranges ordered most specific first, then by network name
    ranges: Vec<(IpNetwork, String)>,
}

/// Maps endpoint addresses to network names
pub struct NetworkClassifier {
    table: RwLock<Arc<NetworkTable>>,
    ambiguity: IntCounter,
}

impl NetworkClassifier {
    /// Create a classifier with an empty table
    pub fn new(ambiguity: IntCounter) -> Self {
        Self {
            table: RwLock::new(Arc::new(NetworkTable::default())),
            ambiguity,
        }
    }

    /// Rebuild the table from a configuration snapshot. An absent or empty
    /// configuration yields an empty table.
    pub fn rebuild(&self, networks: Option<&MeshNetworks>, cluster_id: &str) {
        let mut table = NetworkTable::default();

        for (name, network) in networks.map(|n| &n.networks).into_iter().flatten() {
            for ep in &network.endpoints {
                if ep.from_registry.as_deref() == Some(cluster_id) {
                    table.registry_network = Some(name.clone());
                }
                let Some(cidr) = ep.from_cidr.as_deref() else {
                    continue;
                };
                match IpNetwork::from_str(cidr) {
                    Ok(range) => table.ranges.push((range, name.clone())),
                    Err(e) => warn!("unable to parse CIDR {} for network {}: {}", cidr, name, e),
                }
            }
        }

        table
            .ranges
            .sort_by(|(a, an), (b, bn)| b.prefix().cmp(&a.prefix()).then_with(|| an.cmp(bn)));

        info!(
            "Network table rebuilt: {} ranges, registry network {:?}",
            table.ranges.len(),
            table.registry_network
        );

        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
    }

    /// Network of an endpoint address; empty when unclassified
    pub fn classify(&self, address: &str) -> String {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner).clone();

        if let Some(network) = &table.registry_network {
            return network.clone();
        }

        let ip = match IpAddr::from_str(address) {
            Ok(ip) => ip,
            Err(_) => {
                debug!("unable to parse endpoint address {}", address);
                return String::new();
            }
        };

        let mut matches = table.ranges.iter().filter(|(range, _)| range.contains(ip));
        let Some((_, network)) = matches.next() else {
            return String::new();
        };

        let others: Vec<&str> = matches.map(|(_, n)| n.as_str()).collect();
        if !others.is_empty() {
            warn!(
                "Found multiple networks CIDRs matching the endpoint IP: {}. Using {}, also matched {:?}",
                address, network, others
            );
            self.ambiguity.inc();
        }

        network.clone()
    }
}
