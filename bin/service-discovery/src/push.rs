//! Push sink that reports registry changes to the log

use mesh_core::{Endpoint, Event, XdsUpdater};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Logs every push. Stands in for an xDS server in a standalone registry.
#[derive(Default)]
pub struct TracingXdsUpdater {
    pushes: AtomicU64,
}

impl TracingXdsUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pushes reported so far
    pub fn pushes(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }
}

impl XdsUpdater for TracingXdsUpdater {
    fn svc_update(&self, cluster_id: &str, name: &str, namespace: &str, event: Event) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        info!("[{}] service {}/{} {}", cluster_id, namespace, name, event);
    }

    fn eds_update(
        &self,
        cluster_id: &str,
        hostname: &str,
        namespace: &str,
        endpoints: Vec<Endpoint>,
    ) -> mesh_core::Result<()> {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        info!(
            "[{}] endpoints of {} in {}: {} endpoints",
            cluster_id,
            hostname,
            namespace,
            endpoints.len()
        );
        for ep in &endpoints {
            debug!(
                "  {}:{} ({}) network={} locality={}",
                ep.address, ep.endpoint_port, ep.service_port_name, ep.network, ep.locality.label
            );
        }
        Ok(())
    }

    fn config_update(&self, full: bool) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        info!("Configuration push requested (full: {})", full);
    }
}
