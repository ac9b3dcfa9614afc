//! File-backed mesh networks configuration

use mesh_api::MeshNetworks;
use mesh_core::network::{NetworksHandler, NetworksWatcher};
use mesh_core::Result;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Loaded {
    raw: String,
    networks: Option<MeshNetworks>,
}

/// Polls a YAML mesh networks file and notifies handlers when its content
/// changes
pub struct FileNetworksWatcher {
    path: PathBuf,
    interval: Duration,
    loaded: RwLock<Loaded>,
    handlers: RwLock<Vec<NetworksHandler>>,
}

impl FileNetworksWatcher {
    /// Create a watcher, loading the file once. A missing or invalid file
    /// leaves the configuration empty until a later poll succeeds.
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        let watcher = Self {
            path: path.into(),
            interval,
            loaded: RwLock::new(Loaded::default()),
            handlers: RwLock::new(Vec::new()),
        };
        if let Err(e) = watcher.reload() {
            warn!("Failed to load mesh networks from {}: {}", watcher.path.display(), e);
        }
        watcher
    }

    /// Re-read the file. Returns true when the configuration changed.
    pub fn reload(&self) -> Result<bool> {
        let raw = std::fs::read_to_string(&self.path)?;
        if self.loaded.read().unwrap_or_else(PoisonError::into_inner).raw == raw {
            return Ok(false);
        }

        let networks: MeshNetworks = if raw.trim().is_empty() {
            MeshNetworks::default()
        } else {
            serde_yaml::from_str(&raw)?
        };
        info!(
            "Loaded mesh networks from {} ({} networks)",
            self.path.display(),
            networks.networks.len()
        );

        *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = Loaded {
            raw,
            networks: Some(networks.clone()),
        };
        for handler in self.handlers.read().unwrap_or_else(PoisonError::into_inner).iter() {
            handler(&networks);
        }
        Ok(true)
    }

    /// Poll the file until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => match self.reload() {
                    Ok(true) => debug!("Mesh networks changed"),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to reload mesh networks: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

impl NetworksWatcher for FileNetworksWatcher {
    fn networks(&self) -> Option<MeshNetworks> {
        self.loaded.read().unwrap_or_else(PoisonError::into_inner).networks.clone()
    }

    fn add_networks_handler(&self, handler: NetworksHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("mesh-networks-{}-{}.yaml", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_and_reload() {
        let path = temp_file(
            "reload",
            "networks:\n  net1:\n    endpoints:\n    - fromCidr: 10.0.0.0/8\n",
        );
        let watcher = FileNetworksWatcher::new(&path, Duration::from_secs(10));
        let networks = watcher.networks().expect("loaded");
        assert_eq!(
            networks.networks["net1"].endpoints[0].from_cidr.as_deref(),
            Some("10.0.0.0/8")
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        watcher.add_networks_handler(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!watcher.reload().unwrap());
        std::fs::write(&path, "networks:\n  net2:\n    endpoints:\n    - fromRegistry: Kubernetes\n").unwrap();
        assert!(watcher.reload().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(watcher.networks().unwrap().networks.contains_key("net2"));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_leaves_config_empty() {
        let path = std::env::temp_dir().join(format!("mesh-networks-{}-missing.yaml", std::process::id()));
        let watcher = FileNetworksWatcher::new(&path, Duration::from_secs(10));
        assert!(watcher.networks().is_none());
        assert!(watcher.reload().is_err());
    }

    #[test]
    fn test_invalid_yaml_keeps_previous() {
        let path = temp_file("invalid", "networks:\n  net1: {}\n");
        let watcher = FileNetworksWatcher::new(&path, Duration::from_secs(10));
        std::fs::write(&path, "networks: [not, a, map").unwrap();
        assert!(watcher.reload().is_err());
        assert!(watcher.networks().unwrap().networks.contains_key("net1"));
        std::fs::remove_file(&path).unwrap();
    }
}
