//! Watch sources over the Kubernetes API
//!
//! A [`WatchSource`] feeds a `kube-runtime` watcher stream into its own
//! reflector store and reports changes to its handler. Objects that vanish
//! across a relist are reported as deleted.

use futures::{Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::core::PartialObjectMeta;
use kube::{Api, Client, Resource};
use kube_runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube_runtime::watcher::{self, metadata_watcher, watcher, Event};
use kube_runtime::WatchStreamExt;
use mesh_core::queue::WatchHandler;
use mesh_core::store::HasSynced;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Full objects of an API selected by `config`, with the default retry backoff
pub fn object_stream<K>(api: Api<K>, config: watcher::Config) -> impl Stream<Item = Result<Event<K>, watcher::Error>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, config).default_backoff()
}

/// Metadata-only objects of an API, with the default retry backoff
pub fn metadata_stream<K>(
    api: Api<K>,
) -> impl Stream<Item = Result<Event<PartialObjectMeta<K>>, watcher::Error>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    metadata_watcher(api, watcher::Config::default()).default_backoff()
}

/// One API per watched namespace, or a single cluster-wide API when the
/// list is empty
pub fn namespaced_apis<K>(client: &Client, namespaces: &[String]) -> Vec<Api<K>>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    if namespaces.is_empty() {
        return vec![Api::all(client.clone())];
    }
    namespaces
        .iter()
        .map(|ns| Api::namespaced(client.clone(), ns))
        .collect()
}

/// Reflector-maintaining consumer of one watcher stream
pub struct WatchSource<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    name: String,
    reader: Store<K>,
    writer: Writer<K>,
    handler: Option<Arc<dyn WatchHandler<K>>>,
}

impl<K> WatchSource<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
{
    pub fn new(name: impl Into<String>) -> Self {
        let (reader, writer) = reflector::store();
        Self {
            name: name.into(),
            reader,
            writer,
            handler: None,
        }
    }

    /// Report changes to a handler in addition to maintaining the store
    pub fn with_handler(mut self, handler: Arc<dyn WatchHandler<K>>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Reader of the store; ready once the initial listing has been applied
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Consume the stream until shutdown
    pub async fn run<S>(mut self, stream: S, mut shutdown: watch::Receiver<bool>)
    where
        S: Stream<Item = Result<Event<K>, watcher::Error>> + Send,
    {
        let mut stream = Box::pin(stream);
        let mut relist = None;
        info!("Starting {} watch", self.name);

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
                item = stream.next() => match item {
                    Some(Ok(event)) => self.apply(event, &mut relist).await,
                    Some(Err(e)) => warn!("{} watch error: {}", self.name, e),
                    None => break,
                },
            }
        }

        info!("{} watch stopped", self.name);
    }

    async fn apply(&mut self, event: Event<K>, relist: &mut Option<HashSet<ObjectRef<K>>>) {
        match event {
            Event::Init => {
                *relist = Some(HashSet::new());
                self.writer.apply_watcher_event(&Event::Init);
            }
            Event::InitApply(obj) => {
                if let Some(seen) = relist.as_mut() {
                    seen.insert(ObjectRef::from_obj(&obj));
                }
                self.upsert(obj, true).await;
            }
            Event::InitDone => {
                let gone: Vec<Arc<K>> = match relist.take() {
                    Some(seen) => self
                        .reader
                        .state()
                        .into_iter()
                        .filter(|obj| !seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                        .collect(),
                    None => Vec::new(),
                };
                let first = !self.reader.has_synced();
                self.writer.apply_watcher_event(&Event::InitDone);
                if first {
                    info!("{} watch synced with {} objects", self.name, self.reader.len());
                }

                for old in gone {
                    debug!("{} {} disappeared across relist", self.name, ObjectRef::from_obj(old.as_ref()));
                    if let Some(handler) = &self.handler {
                        handler.on_delete(old.as_ref().clone()).await;
                    }
                }
            }
            Event::Apply(obj) => self.upsert(obj, false).await,
            Event::Delete(obj) => {
                self.writer.apply_watcher_event(&Event::Delete(obj.clone()));
                if let Some(handler) = &self.handler {
                    handler.on_delete(obj).await;
                }
            }
        }
    }

    /// Store an object, reporting an add or an update against the version
    /// currently visible to readers. Objects of a relist stay buffered by the
    /// writer until the listing completes.
    async fn upsert(&mut self, obj: K, listing: bool) {
        let previous = self.reader.get(&ObjectRef::from_obj(&obj));
        let event = if listing {
            Event::InitApply(obj.clone())
        } else {
            Event::Apply(obj.clone())
        };
        self.writer.apply_watcher_event(&event);

        let Some(handler) = &self.handler else {
            return;
        };
        match previous {
            Some(old) => handler.on_update(old.as_ref(), obj).await,
            None => handler.on_add(obj).await,
        }
    }
}
