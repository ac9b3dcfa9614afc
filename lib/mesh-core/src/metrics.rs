//! Prometheus metrics of the service registry

use crate::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Counters recorded by the registry controller
#[derive(Clone)]
pub struct RegistryMetrics {
    /// Watch events by resource type and event kind
    pub k8s_events: IntCounterVec,
    /// Endpoint addresses that could not be matched to a pod
    pub endpoints_with_no_pods: IntCounter,
    /// Proxies for which no service instance was found
    pub proxy_no_service: IntCounter,
    /// Addresses contained by more than one configured network
    pub network_ambiguity: IntCounter,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl RegistryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let k8s_events = IntCounterVec::new(
            Opts::new("mesh_k8s_reg_events", "Events from k8s registry."),
            &["type", "event"],
        )?;

        let endpoints_with_no_pods = IntCounter::new(
            "mesh_k8s_endpoints_with_no_pods",
            "Endpoints that does not have any corresponding pods.",
        )?;

        let proxy_no_service = IntCounter::new(
            "mesh_proxy_no_service",
            "Proxies resolved to an empty list of service instances.",
        )?;

        let network_ambiguity = IntCounter::new(
            "mesh_network_ambiguity",
            "Endpoint addresses matching more than one network CIDR.",
        )?;

        registry.register(Box::new(k8s_events.clone()))?;
        registry.register(Box::new(endpoints_with_no_pods.clone()))?;
        registry.register(Box::new(proxy_no_service.clone()))?;
        registry.register(Box::new(network_ambiguity.clone()))?;

        Ok(Self {
            k8s_events,
            endpoints_with_no_pods,
            proxy_no_service,
            network_ambiguity,
            registry,
        })
    }

    /// Count one watch event
    pub fn record_event(&self, kind: &str, event: &str) {
        self.k8s_events.with_label_values(&[kind, event]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::CoreError::Internal(e.to_string()))
    }
}
