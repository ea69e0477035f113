use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use kube::{Api, Client};
use tracing::{info, warn};

use crate::error::ClusterReadError;

/// Read access to the Kubernetes objects the webhook consults
#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterReadError>;

    async fn service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, ClusterReadError>;

    async fn namespace(&self, name: &str) -> Result<Namespace, ClusterReadError>;
}

/// Cluster reader backed by the kube client
#[derive(Clone)]
pub struct KubeReader {
    client: Client,
}

impl KubeReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl From<Client> for KubeReader {
    fn from(client: Client) -> Self {
        Self::new(client)
    }
}

fn not_found(kind: &'static str, namespace: &str, name: &str) -> ClusterReadError {
    ClusterReadError::NotFound {
        kind,
        namespace: namespace.to_owned(),
        name: name.to_owned(),
    }
}

#[async_trait]
impl ClusterReader for KubeReader {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterReadError> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| not_found("Secret", namespace, name))
    }

    async fn service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, ClusterReadError> {
        Api::<ServiceAccount>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| not_found("ServiceAccount", namespace, name))
    }

    async fn namespace(&self, name: &str) -> Result<Namespace, ClusterReadError> {
        Api::<Namespace>::all(self.client.clone())
            .get_opt(name)
            .await?
            .ok_or_else(|| not_found("Namespace", "", name))
    }
}

/// Shared handle to the cluster, resolved once at startup
///
/// A client that could not be built stays unavailable for the lifetime of
/// the process. Consumers then act as if the cluster holds no data.
#[derive(Clone)]
pub enum ClusterAccess {
    Available(Arc<dyn ClusterReader>),
    Unavailable(String),
}

impl ClusterAccess {
    /// Builds a client from the in-cluster or kubeconfig environment
    pub async fn connect() -> Self {
        match Client::try_default().await {
            Ok(client) => {
                info!("connected to kubernetes api");
                Self::Available(Arc::new(KubeReader::new(client)))
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "failed to create kubernetes client, continuing without cluster access"
                );
                Self::Unavailable(err.to_string())
            }
        }
    }

    pub fn available(reader: impl ClusterReader + 'static) -> Self {
        Self::Available(Arc::new(reader))
    }

    pub fn reader(&self) -> Result<&dyn ClusterReader, ClusterReadError> {
        match self {
            Self::Available(reader) => Ok(reader.as_ref()),
            Self::Unavailable(reason) => Err(ClusterReadError::Unavailable(reason.clone())),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}
