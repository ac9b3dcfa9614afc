//! Kubernetes service registry for the Datum mesh control plane
//!
//! This library provides:
//! - Conversion of services, pods, nodes and endpoints into a canonical service model
//! - An ingestion queue that applies watch events serially, with retries
//! - Queries used by proxy configuration: services, instances by port, proxy instances
//! - Endpoint pushes to a downstream xDS updater

pub mod builder;
pub mod cache;
pub mod convert;
pub mod endpoint;
pub mod endpoints;
pub mod error;
pub mod locality;
pub mod metrics;
pub mod model;
pub mod network;
pub mod options;
pub mod pod_cache;
pub mod queue;
pub mod registry;
pub mod store;
pub mod xds;

#[cfg(test)]
mod testing;

pub use endpoint::Endpoint;
pub use error::{CoreError, Result};
pub use model::{Event, Hostname, Labels, Proxy, Service, ServiceInstance};
pub use options::{EndpointMode, Options};
pub use queue::{EnqueueHandler, Queue, Task, WatchHandler};
pub use registry::{Controller, Dependencies};
pub use xds::XdsUpdater;
