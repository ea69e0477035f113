//! Registry credentials from image pull secrets
//!
//! Secrets are read from the pod spec's `imagePullSecrets` and from the
//! service account the pod runs as. Every failure is logged and skipped: a
//! workload whose credentials cannot be read is inspected anonymously.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::core::v1::{LocalObjectReference, PodSpec, Secret};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cluster::{ClusterAccess, ClusterReader};
use crate::error::CredentialError;
use crate::registry::{RegistryHost, is_valid_host, normalize_host};

const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKERCFG_TYPE: &str = "kubernetes.io/dockercfg";
const DOCKERCFG_KEY: &str = ".dockercfg";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

#[derive(Debug, Default, Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
struct DockerAuthEntry {
    username: String,
    password: String,
    auth: String,
    #[serde(rename = "identitytoken")]
    identity_token: String,
}

/// Resolves registry credentials for a workload
#[derive(Clone)]
pub struct RegistryCredentialResolver {
    cluster: ClusterAccess,
}

impl RegistryCredentialResolver {
    pub fn new(cluster: ClusterAccess) -> Self {
        Self { cluster }
    }

    /// Returns the registry hosts usable by `pod_spec`
    ///
    /// An empty result means no credential hints.
    pub async fn resolve_hosts(
        &self,
        namespace: &str,
        pod_spec: Option<&PodSpec>,
    ) -> Vec<RegistryHost> {
        let Some(pod_spec) = pod_spec else {
            return Vec::new();
        };
        if namespace.is_empty() {
            return Vec::new();
        }

        let reader = match self.cluster.reader() {
            Ok(reader) => reader,
            Err(err) => {
                debug!(error = %err, "kubernetes client unavailable for registry credentials");
                return Vec::new();
            }
        };

        let secret_names = collect_secret_names(reader, namespace, pod_spec).await;
        let mut hosts = Vec::new();
        for name in &secret_names {
            let secret = match reader.secret(namespace, name).await {
                Ok(secret) => secret,
                Err(err) => {
                    warn!(
                        secret = %name,
                        namespace,
                        error = %err,
                        "failed to load image pull secret"
                    );
                    continue;
                }
            };

            match hosts_from_secret(&secret) {
                Ok(secret_hosts) => hosts.extend(secret_hosts),
                Err(err) => {
                    warn!(
                        secret = %name,
                        namespace,
                        error = %err,
                        "failed to parse image pull secret"
                    );
                }
            }
        }

        debug!(
            namespace,
            secrets = secret_names.len(),
            hosts = hosts.len(),
            "resolved registry hosts"
        );
        hosts
    }
}

fn reference_names(
    refs: Option<&Vec<LocalObjectReference>>,
) -> impl Iterator<Item = String> + '_ {
    refs.into_iter()
        .flatten()
        .filter_map(|r| (!r.name.is_empty()).then(|| r.name.clone()))
}

async fn collect_secret_names(
    reader: &dyn ClusterReader,
    namespace: &str,
    pod_spec: &PodSpec,
) -> BTreeSet<String> {
    let mut names: BTreeSet<String> =
        reference_names(pod_spec.image_pull_secrets.as_ref()).collect();

    let service_account = pod_spec
        .service_account_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_SERVICE_ACCOUNT);

    match reader.service_account(namespace, service_account).await {
        Ok(sa) => names.extend(reference_names(sa.image_pull_secrets.as_ref())),
        Err(err) => {
            debug!(service_account, namespace, error = %err, "failed to load service account");
        }
    }

    names
}

fn secret_payload<'a>(secret: &'a Secret, key: &'static str) -> Result<&'a [u8], CredentialError> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.as_slice())
        .filter(|bytes| !bytes.is_empty())
        .ok_or(CredentialError::MissingKey(key))
}

fn hosts_from_secret(secret: &Secret) -> Result<Vec<RegistryHost>, CredentialError> {
    let auths = match secret.type_.as_deref() {
        Some(DOCKER_CONFIG_JSON_TYPE) => {
            let payload = secret_payload(secret, DOCKER_CONFIG_JSON_KEY)?;
            serde_json::from_slice::<DockerConfigJson>(payload)?.auths
        }
        Some(DOCKERCFG_TYPE) => {
            let payload = secret_payload(secret, DOCKERCFG_KEY)?;
            serde_json::from_slice::<BTreeMap<String, DockerAuthEntry>>(payload)?
        }
        other => return Err(CredentialError::UnsupportedType(other.map(str::to_owned))),
    };

    Ok(hosts_from_auths(auths))
}

fn hosts_from_auths(auths: BTreeMap<String, DockerAuthEntry>) -> Vec<RegistryHost> {
    let mut hosts = Vec::new();
    for (registry, mut entry) in auths {
        if entry.username.is_empty() && entry.password.is_empty() && !entry.auth.is_empty() {
            match decode_docker_auth(&entry.auth) {
                Ok((username, password)) => {
                    entry.username = username;
                    entry.password = password;
                }
                Err(err) => {
                    warn!(registry = %registry, error = %err, "failed to decode docker auth");
                    continue;
                }
            }
        }

        if entry.username.is_empty()
            && entry.password.is_empty()
            && entry.identity_token.is_empty()
        {
            continue;
        }

        let host = normalize_host(&registry);
        if !is_valid_host(&host) {
            debug!(registry = %registry, "skipping invalid registry host");
            continue;
        }

        hosts.push(RegistryHost {
            host,
            username: entry.username,
            password: entry.password,
            identity_token: entry.identity_token,
        });
    }
    hosts
}

/// Splits a base64 `user:password` blob on the first colon
fn decode_docker_auth(encoded: &str) -> Result<(String, String), CredentialError> {
    let decoded = STANDARD.decode(encoded.trim())?;
    let decoded = String::from_utf8_lossy(&decoded);
    let (username, password) = decoded.split_once(':').ok_or(CredentialError::AuthFormat)?;
    Ok((username.to_owned(), password.to_owned()))
}
