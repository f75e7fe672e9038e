//! Kubernetes client construction.

use std::path::{Path, PathBuf};

use kube::config::{InClusterError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use thiserror::Error;
use tracing::{debug, info};

/// Errors building a Kubernetes client.
#[derive(Debug, Error)]
pub enum KubeError {
    /// Not running in a cluster and no kubeconfig path was given.
    #[error("not running in a cluster and no kubeconfig path was given: {0}")]
    MissingKubeConfig(#[source] InClusterError),

    #[error("failed to load kubeconfig {path:?}: {source}")]
    InvalidKubeConfig {
        path: PathBuf,
        #[source]
        source: KubeconfigError,
    },

    #[error("failed to create kubernetes client: {0}")]
    InvalidKubeClient(#[source] kube::Error),
}

/// Build a client from the in-cluster service account, falling back to the
/// kubeconfig at `kubeconfig_path`.
pub async fn new_kube_client(kubeconfig_path: Option<&Path>) -> Result<Client, KubeError> {
    let config = match Config::incluster() {
        Ok(config) => {
            info!("Using in-cluster kubernetes configuration");
            config
        }
        Err(e) => {
            let Some(path) = kubeconfig_path else {
                return Err(KubeError::MissingKubeConfig(e));
            };
            debug!(error = %e, "In-cluster configuration unavailable");
            let config = load_kubeconfig(path).await?;
            info!(path = %path.display(), "Using kubeconfig");
            config
        }
    };

    Client::try_from(config).map_err(KubeError::InvalidKubeClient)
}

async fn load_kubeconfig(path: &Path) -> Result<Config, KubeError> {
    let invalid = |source| KubeError::InvalidKubeConfig {
        path: path.to_path_buf(),
        source,
    };

    let kubeconfig = Kubeconfig::read_from(path).map_err(invalid)?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(invalid)
}
