//! Kubernetes service registry controller
//!
//! The [`Controller`] owns the derived registry state. Watch sources feed it
//! through the ingestion [`Queue`]; queries run concurrently against the same
//! state from any caller.

mod eds;
mod foreign;
mod node;
mod proxy;
mod service;

use crate::builder::EndpointBuilder;
use crate::cache::RegistryCache;
use crate::endpoint::Locality;
use crate::endpoints::{new_endpoint_source, EndpointAddress, EndpointSource};
use crate::locality::{LocalityResolver, NodeLookup};
use crate::metrics::RegistryMetrics;
use crate::model::{Event, Hostname, Service, ServiceInstance};
use crate::network::{NetworkClassifier, NetworksWatcher};
use crate::options::Options;
use crate::pod_cache::PodCache;
use crate::queue::{Queue, Task, TaskHandler, WatchObject};
use crate::store::{HasSynced, ObjectStore, ServiceLister};
use crate::xds::{InstanceHandler, ServiceHandler, XdsUpdater};
use crate::{CoreError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

/// Collaborators of a controller
pub struct Dependencies {
    pub xds: Arc<dyn XdsUpdater>,
    /// Raw services, read when matching selectors
    pub services: Arc<dyn ServiceLister>,
    pub nodes: Arc<dyn NodeLookup>,
    /// Store maintained by the pod watch source
    pub pods: ObjectStore<Pod>,
    pub networks_watcher: Option<Arc<dyn NetworksWatcher>>,
    /// Every watch source that must finish its initial listing before
    /// events are applied
    pub sync_sources: Vec<Arc<dyn HasSynced>>,
}

/// Service registry of one Kubernetes cluster
pub struct Controller {
    options: Options,
    cache: RwLock<RegistryCache>,
    pub(crate) pods: PodCache,
    endpoints: Box<dyn EndpointSource>,
    services: Arc<dyn ServiceLister>,
    locality: LocalityResolver,
    networks: Arc<NetworkClassifier>,
    networks_watcher: Option<Arc<dyn NetworksWatcher>>,
    xds: Arc<dyn XdsUpdater>,
    metrics: RegistryMetrics,
    sync_sources: Vec<Arc<dyn HasSynced>>,
    service_handlers: StdRwLock<Vec<ServiceHandler>>,
    instance_handlers: StdRwLock<Vec<InstanceHandler>>,
}

impl Controller {
    pub fn new(options: Options, deps: Dependencies) -> Result<Self> {
        let metrics = RegistryMetrics::new()?;
        let networks = Arc::new(NetworkClassifier::new(metrics.network_ambiguity.clone()));

        info!(
            "Creating registry controller for cluster {} ({:?})",
            options.cluster_id, options.endpoint_mode
        );

        Ok(Self {
            endpoints: new_endpoint_source(options.endpoint_mode),
            cache: RwLock::new(RegistryCache::new()),
            pods: PodCache::new(deps.pods),
            services: deps.services,
            locality: LocalityResolver::new(deps.nodes),
            networks,
            networks_watcher: deps.networks_watcher,
            xds: deps.xds,
            metrics,
            sync_sources: deps.sync_sources,
            service_handlers: StdRwLock::new(Vec::new()),
            instance_handlers: StdRwLock::new(Vec::new()),
            options,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn cluster_id(&self) -> &str {
        &self.options.cluster_id
    }

    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    /// True once every source has applied its initial listing
    pub fn has_synced(&self) -> bool {
        self.sync_sources.iter().all(|s| s.has_synced())
    }

    /// Rebuild the network table from the current mesh networks snapshot
    pub fn init_network_lookup(&self) {
        if let Some(watcher) = &self.networks_watcher {
            self.networks.rebuild(watcher.networks().as_ref(), &self.options.cluster_id);
        }
    }

    /// Network of an endpoint address
    pub fn endpoint_network(&self, address: &str) -> String {
        self.networks.classify(address)
    }

    /// Apply queued events until shutdown. Events are held back until every
    /// source has synced.
    pub async fn run(self: Arc<Self>, queue: Arc<Queue>, shutdown: watch::Receiver<bool>) {
        if let Some(watcher) = &self.networks_watcher {
            let networks = self.networks.clone();
            let cluster_id = self.options.cluster_id.clone();
            watcher.add_networks_handler(Box::new(move |mesh| networks.rebuild(Some(mesh), &cluster_id)));
            self.init_network_lookup();
        }

        let mut waiting = shutdown.clone();
        let synced = join_all(self.sync_sources.iter().map(|source| source.wait_synced()));
        tokio::select! {
            _ = synced => {}
            _ = waiting.wait_for(|stop| *stop) => return,
        }
        info!("Registry caches synced, applying events");

        queue.run(self.as_ref(), shutdown).await;
        info!("Controller terminated");
    }

    /// Every service, sorted by hostname
    pub async fn services(&self) -> Vec<Arc<Service>> {
        let mut out: Vec<Arc<Service>> = self.cache.read().await.services.values().cloned().collect();
        out.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        out
    }

    pub async fn get_service(&self, hostname: &Hostname) -> Option<Arc<Service>> {
        self.cache.read().await.service(hostname)
    }

    pub fn append_service_handler(&self, handler: ServiceHandler) {
        self.service_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn append_instance_handler(&self, handler: InstanceHandler) {
        self.instance_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn notify_service(&self, service: &Service, event: Event) {
        for handler in self.service_handlers.read().unwrap_or_else(PoisonError::into_inner).iter() {
            handler(service, event);
        }
    }

    fn notify_instances(&self, instances: &[ServiceInstance], event: Event) {
        for handler in self.instance_handlers.read().unwrap_or_else(PoisonError::into_inner).iter() {
            for instance in instances {
                handler(instance, event);
            }
        }
    }

    /// Pod backing an endpoint address: by IP first, then by the address's
    /// pod reference when the pod event has not been applied yet
    pub(crate) async fn pod_for_address(&self, address: &EndpointAddress) -> Option<Arc<Pod>> {
        if let Some(pod) = self.pods.get_pod_by_ip(&address.ip).await {
            return Some(pod);
        }
        let target = address.target.as_ref()?;
        self.pods.get_pod(&target.name, &target.namespace)
    }

    pub(crate) async fn endpoint_builder(&self, pod: &Pod) -> EndpointBuilder {
        let locality = Locality {
            label: self.locality.pod_locality(pod).await,
            cluster_id: self.options.cluster_id.clone(),
        };
        EndpointBuilder::new(pod, locality, &self.options.trust_domain, self.networks.clone())
    }

    pub(crate) async fn on_endpoint_event(&self, object: &WatchObject, event: Event) -> Result<()> {
        if let Some((snapshot, event)) = self.endpoints.apply(object, event) {
            self.update_eds(&snapshot, event).await;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for Controller {
    async fn handle(&self, task: &Task) -> Result<()> {
        if !self.has_synced() {
            return Err(CoreError::NotSynced);
        }
        debug!("Applying {} event for {}", task.event, task.object.key());

        match &task.object {
            WatchObject::Service(svc) => self.on_service_event(svc, task.event).await,
            WatchObject::Node(node) => self.on_node_event(node, task.event).await,
            WatchObject::Pod(pod) => {
                self.pods.on_event(pod, task.event).await;
                Ok(())
            }
            WatchObject::Endpoints(_) | WatchObject::EndpointSlice(_) => {
                self.on_endpoint_event(&task.object, task.event).await
            }
        }
    }
}
