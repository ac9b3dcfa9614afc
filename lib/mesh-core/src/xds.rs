//! Push sink interface and listener types

use crate::endpoint::Endpoint;
use crate::model::{Event, Service, ServiceInstance};
use crate::Result;

/// Downstream consumer of registry changes. Calls are fire-and-forget; the
/// implementation owns its own batching.
pub trait XdsUpdater: Send + Sync {
    /// A service was added, updated or removed
    fn svc_update(&self, cluster_id: &str, name: &str, namespace: &str, event: Event);

    /// Full endpoint set of a service changed
    fn eds_update(&self, cluster_id: &str, hostname: &str, namespace: &str, endpoints: Vec<Endpoint>) -> Result<()>;

    /// Request a configuration push
    fn config_update(&self, full: bool);
}

/// Service-level listener
pub type ServiceHandler = Box<dyn Fn(&Service, Event) + Send + Sync>;

/// Instance-level listener
pub type InstanceHandler = Box<dyn Fn(&ServiceInstance, Event) + Send + Sync>;
