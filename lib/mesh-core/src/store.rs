//! Local object stores backing listers and lookups
//!
//! Every watch source feeds a `kube-runtime` reflector [`Store`]. Namespaced
//! kinds watched in several namespaces get one reflector per namespace, and
//! [`ObjectStore`] reads across all of them.

use crate::Result;
use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Service as KubeService;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};
use std::hash::Hash;
use std::sync::Arc;
use tracing::warn;

/// Readiness of a source after its initial listing
#[async_trait]
pub trait HasSynced: Send + Sync {
    fn has_synced(&self) -> bool;

    /// Resolve once the source has synced, or once it can no longer sync
    async fn wait_synced(&self);
}

#[async_trait]
impl<K> HasSynced for Store<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    fn has_synced(&self) -> bool {
        matches!(self.wait_until_ready().now_or_never(), Some(Ok(())))
    }

    async fn wait_synced(&self) {
        if self.wait_until_ready().await.is_err() {
            warn!("Reflector writer dropped before the initial listing completed");
        }
    }
}

/// Lists raw services of a namespace
pub trait ServiceLister: Send + Sync {
    fn list(&self, namespace: &str) -> Result<Vec<Arc<KubeService>>>;
}

/// Key of an object: `namespace/name`, or just `name` when cluster scoped
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Reference to an object by namespace and name; an empty namespace refers
/// to a cluster scoped object
pub fn object_ref<K>(namespace: &str, name: &str) -> ObjectRef<K>
where
    K: Resource,
    K::DynamicType: Default,
{
    let reference = ObjectRef::new(name);
    if namespace.is_empty() {
        reference
    } else {
        reference.within(namespace)
    }
}

/// Read view over the reflector stores of one resource kind
#[derive(Clone)]
pub struct ObjectStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    stores: Vec<Store<K>>,
}

impl<K> ObjectStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new(stores: Vec<Store<K>>) -> Self {
        Self { stores }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let reference = object_ref::<K>(namespace, name);
        self.stores.iter().find_map(|store| store.get(&reference))
    }

    pub fn state(&self) -> Vec<Arc<K>> {
        self.stores.iter().flat_map(|store| store.state()).collect()
    }

    /// Objects of one namespace
    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.state()
            .into_iter()
            .filter(|obj| obj.namespace().as_deref() == Some(namespace))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stores.iter().map(Store::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.iter().all(Store::is_empty)
    }
}

impl<K> From<Store<K>> for ObjectStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    fn from(store: Store<K>) -> Self {
        Self::new(vec![store])
    }
}

impl ServiceLister for ObjectStore<KubeService> {
    fn list(&self, namespace: &str) -> Result<Vec<Arc<KubeService>>> {
        Ok(self.list_namespace(namespace))
    }
}
