use anyhow::Result;
use futures::future::join_all;
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service as KubeService};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::NamespaceResourceScope;
use kube::core::PartialObjectMeta;
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use mesh_api::WorkloadEntry;
use mesh_core::network::NetworksWatcher;
use mesh_core::queue::WatchHandler;
use mesh_core::store::{HasSynced, ObjectStore};
use mesh_core::{Controller, Dependencies, EndpointMode, EnqueueHandler, Options, Queue};
use mesh_kube::watch::{metadata_stream, namespaced_apis, object_stream};
use mesh_kube::{FileNetworksWatcher, ForeignRegistrar, KubeNodeLookup, NodeLabelCache, WatchSource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod push;

use push::TracingXdsUpdater;

const CONFIG_ENV: &str = "SERVICE_DISCOVERY_CONFIG";

/// Watch sources of one resource kind, one per watched namespace
struct Sources<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    sources: Vec<(WatchSource<K>, Api<K>)>,
}

impl<K> Sources<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn new(client: &Client, namespaces: &[String], name: &str) -> Self {
        let sources = namespaced_apis(client, namespaces)
            .into_iter()
            .map(|api| (WatchSource::new(name), api))
            .collect();
        Self { sources }
    }

    /// Read view across every namespace's store
    fn store(&self) -> ObjectStore<K> {
        ObjectStore::new(self.sources.iter().map(|(source, _)| source.store()).collect())
    }

    fn synced(&self) -> Vec<Arc<dyn HasSynced>> {
        self.sources
            .iter()
            .map(|(source, _)| Arc::new(source.store()) as Arc<dyn HasSynced>)
            .collect()
    }

    fn spawn(self, handler: Arc<dyn WatchHandler<K>>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.sources
            .into_iter()
            .map(|(source, api)| {
                let source = source.with_handler(handler.clone());
                tokio::spawn(source.run(object_stream(api, watcher::Config::default()), shutdown.clone()))
            })
            .collect()
    }
}

fn load_options() -> Result<Options> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            info!("Loading options from {}", path);
            Ok(Options::from_file(Path::new(&path))?)
        }
        Err(_) => Ok(Options::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting service-discovery...");

    let options = load_options()?;
    let client = Client::try_default().await?;
    let namespaces = options.watched_namespaces.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let services = Sources::<KubeService>::new(&client, &namespaces, "Services");
    let pods = Sources::<Pod>::new(&client, &namespaces, "Pods");

    // Nodes feeding gateway address recomputation, optionally narrowed to
    // the nodes that can host a gateway
    let gateway_nodes = WatchSource::<Node>::new("GatewayNodes");
    let gateway_node_config = match &options.gateway_node_selector {
        Some(selector) => {
            info!("Watching gateway nodes matching {}", selector);
            watcher::Config::default().labels(selector)
        }
        None => watcher::Config::default(),
    };

    let mut sync_sources = services.synced();
    sync_sources.extend(pods.synced());
    sync_sources.push(Arc::new(gateway_nodes.store()));

    let mut endpoints = None;
    let mut slices = None;
    match options.endpoint_mode {
        EndpointMode::EndpointsOnly => {
            let source = Sources::<Endpoints>::new(&client, &namespaces, "Endpoints");
            sync_sources.extend(source.synced());
            endpoints = Some(source);
        }
        EndpointMode::EndpointSliceOnly => {
            let source = Sources::<EndpointSlice>::new(&client, &namespaces, "EndpointSlices");
            sync_sources.extend(source.synced());
            slices = Some(source);
        }
    }

    let mut tasks = Vec::new();

    let mut label_cache = NodeLabelCache::new(gateway_nodes.store());
    if options.node_metadata_only {
        let source = WatchSource::<PartialObjectMeta<Node>>::new("NodeMetadata");
        sync_sources.push(Arc::new(source.store()));
        label_cache = label_cache.with_metadata(source.store());
        tasks.push(tokio::spawn(
            source.run(metadata_stream(Api::<Node>::all(client.clone())), shutdown_rx.clone()),
        ));
    }

    let networks_watcher = options
        .mesh_networks_file
        .as_ref()
        .map(|path| Arc::new(FileNetworksWatcher::new(path, options.mesh_networks_poll_interval())));
    if let Some(networks) = &networks_watcher {
        tasks.push(tokio::spawn(networks.clone().run(shutdown_rx.clone())));
    }

    let xds = Arc::new(TracingXdsUpdater::new());
    let controller = Arc::new(Controller::new(
        options.clone(),
        Dependencies {
            xds: xds.clone(),
            services: Arc::new(services.store()),
            nodes: Arc::new(KubeNodeLookup::new(Api::all(client.clone()), label_cache)),
            pods: pods.store(),
            networks_watcher: networks_watcher.map(|w| w as Arc<dyn NetworksWatcher>),
            sync_sources,
        },
    )?);

    let queue = Arc::new(Queue::new(options.retry_delay()));
    let enqueue = Arc::new(EnqueueHandler::new(queue.clone(), controller.metrics().clone()));

    tasks.extend(services.spawn(enqueue.clone(), &shutdown_rx));
    tasks.extend(pods.spawn(enqueue.clone(), &shutdown_rx));
    tasks.push(tokio::spawn(
        gateway_nodes.with_handler(enqueue.clone()).run(
            object_stream(Api::<Node>::all(client.clone()), gateway_node_config),
            shutdown_rx.clone(),
        ),
    ));
    if let Some(source) = endpoints {
        tasks.extend(source.spawn(enqueue.clone(), &shutdown_rx));
    }
    if let Some(source) = slices {
        tasks.extend(source.spawn(enqueue.clone(), &shutdown_rx));
    }

    // Foreign registrations are applied directly, not through the queue
    let workload_entries = Sources::<WorkloadEntry>::new(&client, &namespaces, "WorkloadEntries");
    tasks.extend(workload_entries.spawn(Arc::new(ForeignRegistrar::new(controller.clone())), &shutdown_rx));

    tasks.push(tokio::spawn(controller.clone().run(queue, shutdown_rx.clone())));
    info!("Service registry for cluster {} running", controller.cluster_id());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping watches...");
    shutdown_tx.send(true)?;
    join_all(tasks).await;

    info!("Pushed {} updates", xds.pushes());
    debug!("Final metrics:\n{}", controller.metrics().gather()?);
    Ok(())
}
