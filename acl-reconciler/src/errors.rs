use std::time::Duration;

use acl_reconciler_apis::ValidationError;

use crate::{storage::StorageError, tsuru_client::DirectoryError};

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// An application descriptor without application and pool name cannot be resolved.
    #[error("rule must have an app name or a pool name")]
    EmptyRule,
    /// The cluster record neither embeds a kubeconfig nor lists an address.
    #[error("no addresses for cluster {0}")]
    NoClusterAddress(String),
    /// An engine was asked to sync before `before_sync` handed it a resolution cache.
    #[error("engine {0} has no resolution cache, before_sync was not called")]
    MissingResolutionCache(String),
    /// The periodic sync loop did not observe the shutdown request in time.
    #[error("periodic sync did not stop within {0:?}")]
    ShutdownTimeout(Duration),
    /// Malformed rule descriptors
    #[error("{0}")]
    Validation(#[from] ValidationError),
    /// Rule or sync lock storage errors
    #[error("{0}")]
    Storage(#[from] StorageError),
    /// Endpoint directory lookups
    #[error("{0}")]
    Directory(#[from] DirectoryError),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Failed to turn a cluster record into a client configuration
    #[error("{0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}
