//! Kubernetes API integration for the service registry
//!
//! Watch sources feeding the registry's object stores and ingestion queue,
//! node lookups, the mesh networks file watcher and WorkloadEntry
//! registration.

pub mod networks;
pub mod node;
pub mod watch;
pub mod workload_entry;

pub use networks::FileNetworksWatcher;
pub use node::{KubeNodeLookup, NodeLabelCache};
pub use watch::WatchSource;
pub use workload_entry::ForeignRegistrar;
