use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("waiting till full synchronization")]
    NotSynced,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No suitable port: {0}")]
    PortNotFound(String),

    #[error("Proxy metadata error: {0}")]
    ProxyMetadata(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
