//! Event ingestion
//!
//! Every watch callback is turned into a [`Task`] and pushed onto one
//! [`Queue`]. A single consumer applies tasks in submission order, so no two
//! handler invocations ever overlap. A task whose handler fails (including
//! "not synced yet") is pushed again after a fixed delay.

use crate::metrics::RegistryMetrics;
use crate::model::Event;
use crate::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Resource kinds flowing through the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    Pod,
    Node,
    Endpoints,
    EndpointSlice,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Service => "Services",
            ResourceKind::Pod => "Pods",
            ResourceKind::Node => "Nodes",
            ResourceKind::Endpoints => "Endpoints",
            ResourceKind::EndpointSlice => "EndpointSlices",
        }
    }
}

/// Payload of a task
#[derive(Clone, Debug)]
pub enum WatchObject {
    Service(Box<Service>),
    Pod(Box<Pod>),
    Node(Box<Node>),
    Endpoints(Box<Endpoints>),
    EndpointSlice(Box<EndpointSlice>),
}

impl WatchObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            WatchObject::Service(_) => ResourceKind::Service,
            WatchObject::Pod(_) => ResourceKind::Pod,
            WatchObject::Node(_) => ResourceKind::Node,
            WatchObject::Endpoints(_) => ResourceKind::Endpoints,
            WatchObject::EndpointSlice(_) => ResourceKind::EndpointSlice,
        }
    }

    /// `namespace/name` of the payload, for logging
    pub fn key(&self) -> String {
        let (ns, name) = match self {
            WatchObject::Service(o) => (o.namespace(), o.name_any()),
            WatchObject::Pod(o) => (o.namespace(), o.name_any()),
            WatchObject::Node(o) => (o.namespace(), o.name_any()),
            WatchObject::Endpoints(o) => (o.namespace(), o.name_any()),
            WatchObject::EndpointSlice(o) => (o.namespace(), o.name_any()),
        };
        crate::store::object_key(&ns.unwrap_or_default(), &name)
    }
}

/// One unit of ingestion work
#[derive(Clone, Debug)]
pub struct Task {
    pub event: Event,
    pub object: WatchObject,
    /// Failed attempts so far
    pub attempts: u32,
}

impl Task {
    pub fn new(event: Event, object: WatchObject) -> Self {
        Self {
            event,
            object,
            attempts: 0,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.object.kind()
    }
}

/// A raw resource that can be ingested
pub trait Watched: Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    /// True when an update changes nothing the registry reads
    fn unchanged(old: &Self, new: &Self) -> bool;

    fn into_object(self) -> WatchObject;
}

impl Watched for Service {
    const KIND: ResourceKind = ResourceKind::Service;

    fn unchanged(old: &Self, new: &Self) -> bool {
        let lb = |s: &Service| s.status.as_ref().and_then(|st| st.load_balancer.clone());
        old.metadata.labels == new.metadata.labels
            && old.metadata.annotations == new.metadata.annotations
            && old.spec == new.spec
            && lb(old) == lb(new)
    }

    fn into_object(self) -> WatchObject {
        WatchObject::Service(Box::new(self))
    }
}

impl Watched for Node {
    const KIND: ResourceKind = ResourceKind::Node;

    fn unchanged(old: &Self, new: &Self) -> bool {
        let addresses = |n: &Node| n.status.as_ref().and_then(|s| s.addresses.clone());
        old.metadata.labels == new.metadata.labels && addresses(old) == addresses(new)
    }

    fn into_object(self) -> WatchObject {
        WatchObject::Node(Box::new(self))
    }
}

impl Watched for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn unchanged(old: &Self, new: &Self) -> bool {
        let node = |p: &Pod| p.spec.as_ref().and_then(|s| s.node_name.clone());
        let account = |p: &Pod| p.spec.as_ref().and_then(|s| s.service_account_name.clone());
        let ports = |p: &Pod| {
            p.spec
                .as_ref()
                .map(|s| s.containers.iter().map(|c| c.ports.clone()).collect::<Vec<_>>())
        };
        let ip = |p: &Pod| p.status.as_ref().and_then(|s| s.pod_ip.clone());
        let phase = |p: &Pod| p.status.as_ref().and_then(|s| s.phase.clone());

        old.metadata.labels == new.metadata.labels
            && old.metadata.annotations == new.metadata.annotations
            && node(old) == node(new)
            && account(old) == account(new)
            && ports(old) == ports(new)
            && ip(old) == ip(new)
            && phase(old) == phase(new)
    }

    fn into_object(self) -> WatchObject {
        WatchObject::Pod(Box::new(self))
    }
}

impl Watched for Endpoints {
    const KIND: ResourceKind = ResourceKind::Endpoints;

    /// Only ready addresses and ports matter; not-ready churn is ignored
    fn unchanged(old: &Self, new: &Self) -> bool {
        let empty = Vec::new();
        let a = old.subsets.as_ref().unwrap_or(&empty);
        let b = new.subsets.as_ref().unwrap_or(&empty);
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| x.ports == y.ports && x.addresses == y.addresses)
    }

    fn into_object(self) -> WatchObject {
        WatchObject::Endpoints(Box::new(self))
    }
}

impl Watched for EndpointSlice {
    const KIND: ResourceKind = ResourceKind::EndpointSlice;

    fn unchanged(old: &Self, new: &Self) -> bool {
        old.metadata.labels == new.metadata.labels
            && old.endpoints == new.endpoints
            && old.ports == new.ports
    }

    fn into_object(self) -> WatchObject {
        WatchObject::EndpointSlice(Box::new(self))
    }
}

/// Receiver of add/update/delete notifications from a watch source
#[async_trait]
pub trait WatchHandler<K: Send + Sync + 'static>: Send + Sync {
    async fn on_add(&self, obj: K);
    async fn on_update(&self, old: &K, new: K);
    async fn on_delete(&self, obj: K);
}

/// Applies a task on the consumer side of the queue
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<()>;
}

/// Ordered task queue with a single consumer
pub struct Queue {
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
    retry_delay: Duration,
}

impl Queue {
    pub fn new(retry_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            retry_delay,
        }
    }

    pub fn push(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("Ingestion queue closed, dropping task");
        }
    }

    /// Consume tasks until the shutdown signal fires
    pub async fn run(&self, handler: &dyn TaskHandler, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.rx.lock().await;
        info!("Ingestion queue started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                task = rx.recv() => match task {
                    Some(task) => self.process(handler, task).await,
                    None => break,
                },
            }
        }

        info!("Ingestion queue terminated");
    }

    async fn process(&self, handler: &dyn TaskHandler, mut task: Task) {
        debug!(
            "Handling {} event for {} {}",
            task.event,
            task.kind().as_str(),
            task.object.key()
        );
        if let Err(e) = handler.handle(&task).await {
            task.attempts += 1;
            info!(
                "Work item {} {} failed ({}), retry after delay {:?}",
                task.kind().as_str(),
                task.object.key(),
                e,
                self.retry_delay
            );
            let tx = self.tx.clone();
            let delay = self.retry_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(task);
            });
        }
    }

    #[cfg(test)]
    pub(crate) async fn try_pop(&self) -> Option<Task> {
        self.rx.lock().await.try_recv().ok()
    }
}

/// Watch handler that turns callbacks into queued tasks, dropping updates
/// that change nothing the registry reads
pub struct EnqueueHandler {
    queue: Arc<Queue>,
    metrics: RegistryMetrics,
}

impl EnqueueHandler {
    pub fn new(queue: Arc<Queue>, metrics: RegistryMetrics) -> Self {
        Self { queue, metrics }
    }
}

#[async_trait]
impl<K: Watched> WatchHandler<K> for EnqueueHandler {
    async fn on_add(&self, obj: K) {
        self.metrics.record_event(K::KIND.as_str(), "add");
        self.queue.push(Task::new(Event::Add, obj.into_object()));
    }

    async fn on_update(&self, old: &K, new: K) {
        if K::unchanged(old, &new) {
            self.metrics.record_event(K::KIND.as_str(), "updatesame");
            return;
        }
        self.metrics.record_event(K::KIND.as_str(), "update");
        self.queue.push(Task::new(Event::Update, new.into_object()));
    }

    async fn on_delete(&self, obj: K) {
        self.metrics.record_event(K::KIND.as_str(), "delete");
        self.queue.push(Task::new(Event::Delete, obj.into_object()));
    }
}
