use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::cache::PlatformCache;
use crate::checker::ManifestPlatformChecker;
use crate::cluster::ClusterAccess;
use crate::config::PlatformTolerationConfig;
use crate::credentials::RegistryCredentialResolver;
use crate::error::AdmissionError;
use crate::filter::{NamespaceFilter, is_opted_out};
use crate::platforms::{self, WorkloadPlatformResolver};
use crate::registry::ManifestInspector;
use crate::tolerations::patch_tolerations;

#[async_trait]
pub trait MutatingAdmissionHandler: Send + Sync {
    /// Error type returned by the handler
    type Err: StdError + Send + Sync + 'static;

    /// Returns the name of this handler for logging purposes
    fn name(&self) -> &'static str;

    /// Mutates the resource in the admission request
    ///
    /// Returns an `AdmissionResponse` that may include a JSON patch. Requests
    /// that need no change get `AdmissionResponse::from(req)`.
    async fn mutate(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, Self::Err>;
}

/// Workload kinds whose pod spec can carry tolerations
trait Workload: Resource + Clone + Serialize + DeserializeOwned + Send + Sync {
    const KIND: &'static str;

    fn pod_spec(&self) -> Option<&PodSpec>;

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;
}

impl Workload for Pod {
    const KIND: &'static str = "Pod";

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()
    }
}

impl Workload for DaemonSet {
    const KIND: &'static str = "DaemonSet";

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

/// Decides the toleration patch for an admitted Pod or DaemonSet
///
/// Responses are always allowed. A patch is attached only when at least one
/// configured platform is supported by every container image and its
/// toleration is not already present.
#[derive(Clone)]
pub struct AdmissionEngine {
    config: Arc<PlatformTolerationConfig>,
    namespaces: Arc<NamespaceFilter>,
    cluster: ClusterAccess,
    credentials: RegistryCredentialResolver,
    platforms: WorkloadPlatformResolver,
}

impl AdmissionEngine {
    pub fn new(
        config: Arc<PlatformTolerationConfig>,
        namespaces: NamespaceFilter,
        cluster: ClusterAccess,
        cache: Arc<dyn PlatformCache>,
        inspector: Arc<dyn ManifestInspector>,
    ) -> Self {
        let checker = ManifestPlatformChecker::new(cache, inspector);
        Self {
            config,
            namespaces: Arc::new(namespaces),
            credentials: RegistryCredentialResolver::new(cluster.clone()),
            cluster,
            platforms: WorkloadPlatformResolver::new(checker),
        }
    }

    /// Processes a raw admission review body into the response review
    pub async fn process(
        &self,
        body: &[u8],
    ) -> Result<AdmissionReview<DynamicObject>, AdmissionError> {
        let review: AdmissionReview<DynamicObject> =
            serde_json::from_slice(body).map_err(AdmissionError::Decode)?;
        let req: AdmissionRequest<DynamicObject> = review
            .try_into()
            .map_err(|err| AdmissionError::InvalidRequest(format!("{err}")))?;

        let name = req.object.as_ref().map(|o| o.name_any()).unwrap_or_default();
        match self.mutate(&req).await {
            Ok(res) => {
                info!(
                    handler = self.name(),
                    operation = ?req.operation,
                    kind = %req.kind.kind,
                    name = %name,
                    patched = res.patch.is_some(),
                    "processed admission review"
                );
                Ok(res.into_review())
            }
            Err(err) => {
                error!(
                    handler = self.name(),
                    operation = ?req.operation,
                    kind = %req.kind.kind,
                    name = %name,
                    error = %err,
                    "mutation failed"
                );
                Err(err)
            }
        }
    }

    async fn mutate_workload<W: Workload>(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, AdmissionError> {
        let object = req
            .object
            .as_ref()
            .ok_or_else(|| AdmissionError::MissingObject(W::KIND.to_owned()))?;
        let workload: W = serde_json::to_value(object)
            .and_then(serde_json::from_value)
            .map_err(|source| AdmissionError::ObjectDecode { kind: W::KIND, source })?;

        let response = AdmissionResponse::from(req);
        let namespace = req
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| workload.meta().namespace.clone())
            .unwrap_or_default();

        if self.should_skip(&workload, &namespace).await {
            return Ok(response);
        }

        let spec = workload.pod_spec();
        let hosts = self.credentials.resolve_hosts(&namespace, spec).await;
        let containers = spec.map(platforms::containers).unwrap_or_default();
        let supported = self
            .platforms
            .supported_platforms(&containers, &hosts, &self.config)
            .await;

        if supported.is_empty() {
            debug!(kind = W::KIND, namespace = %namespace, "no supported platforms, not patching");
            return Ok(response);
        }

        let mut mutated = workload.clone();
        if let Some(spec) = mutated.pod_spec_mut() {
            patch_tolerations(&self.config, &mut spec.tolerations, &supported);
        }

        let serialize = |source| AdmissionError::Serialize { kind: W::KIND, source };
        let original = serde_json::to_value(&workload).map_err(serialize)?;
        let patched = serde_json::to_value(&mutated).map_err(serialize)?;
        let patch = json_patch::diff(&original, &patched);

        debug!(
            kind = W::KIND,
            namespace = %namespace,
            supported = ?supported,
            ops = patch.0.len(),
            "built toleration patch"
        );
        response
            .with_patch(patch)
            .map_err(|err| AdmissionError::Patch(err.to_string()))
    }

    async fn should_skip<W: Workload>(&self, workload: &W, namespace: &str) -> bool {
        let name = workload.name_any();

        if is_opted_out(workload.meta().annotations.as_ref()) {
            info!(
                kind = W::KIND,
                name = %name,
                namespace,
                "skipping workload due to disabled annotation"
            );
            return true;
        }

        if namespace.is_empty() {
            return false;
        }

        if self.namespaces.is_ignored(namespace) {
            info!(
                kind = W::KIND,
                name = %name,
                namespace,
                "skipping workload in ignored namespace"
            );
            return true;
        }

        let reader = match self.cluster.reader() {
            Ok(reader) => reader,
            Err(err) => {
                debug!(
                    namespace,
                    error = %err,
                    "kubernetes client unavailable for namespace check"
                );
                return false;
            }
        };

        match reader.namespace(namespace).await {
            Ok(ns) if !self.namespaces.should_process(&ns) => {
                info!(
                    kind = W::KIND,
                    name = %name,
                    namespace,
                    "skipping workload due to namespace filter"
                );
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!(namespace, error = %err, "failed to get namespace");
                false
            }
        }
    }
}

#[async_trait]
impl MutatingAdmissionHandler for AdmissionEngine {
    type Err = AdmissionError;

    fn name(&self) -> &'static str {
        "multiarcher"
    }

    async fn mutate(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, Self::Err> {
        match req.kind.kind.as_str() {
            "Pod" => self.mutate_workload::<Pod>(req).await,
            "DaemonSet" => self.mutate_workload::<DaemonSet>(req).await,
            other => Err(AdmissionError::UnsupportedKind(other.to_owned())),
        }
    }
}
