//! Registry credentials and manifest inspection
//!
//! [`ManifestInspector`] is the seam between platform resolution and the
//! network. The production implementation pulls the top-level manifest with
//! `oci-distribution` and lists the platforms of its image index; it never
//! pulls layers or platform-specific manifests.

use std::fmt;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciManifest, Platform};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tracing::debug;

use crate::error::InspectError;

/// Canonical name of Docker Hub
const DOCKER_HUB: &str = "docker.io";

/// Credentials for one registry host, derived from an image pull secret
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryHost {
    pub host: String,
    pub username: String,
    pub password: String,
    pub identity_token: String,
}

impl RegistryHost {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: String::new(),
            password: String::new(),
            identity_token: String::new(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty() || !self.identity_token.is_empty()
    }

    fn auth(&self) -> RegistryAuth {
        if !self.username.is_empty() || !self.password.is_empty() {
            RegistryAuth::Basic(self.username.clone(), self.password.clone())
        } else {
            // identity tokens need an OAuth2 refresh exchange the manifest
            // client does not perform
            debug!(
                host = %self.host,
                "identity token credentials unsupported, using anonymous access"
            );
            RegistryAuth::Anonymous
        }
    }
}

impl fmt::Debug for RegistryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &str| if s.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("RegistryHost")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("identity_token", &redact(&self.identity_token))
            .finish()
    }
}

/// Reduces a docker config registry key to a bare host
///
/// Keys may be written as URLs (`https://index.docker.io/v1/`). Docker Hub
/// aliases collapse to `docker.io`.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let without_scheme = raw
        .split_once("://")
        .map_or(raw, |(_, rest)| rest);
    let host = without_scheme
        .split_once('/')
        .map_or(without_scheme, |(host, _)| host)
        .to_ascii_lowercase();

    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            DOCKER_HUB.to_owned()
        }
        _ => host,
    }
}

/// Checks that `host` is a plain `hostname[:port]` or `[ipv6][:port]`
pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    let (name, port) = if let Some(rest) = host.strip_prefix('[') {
        let Some((addr, tail)) = rest.split_once(']') else {
            return false;
        };
        if addr.is_empty() || !addr.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return false;
        }
        match tail {
            "" => return true,
            tail => match tail.strip_prefix(':') {
                Some(port) => ("", Some(port)),
                None => return false,
            },
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) => (name, Some(port)),
            None => (host, None),
        }
    };

    if let Some(port) = port {
        if port.is_empty() || port.parse::<u16>().is_err() {
            return false;
        }
    }

    if name.is_empty() {
        return host.starts_with('[');
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Renders an index platform as `os/arch[/variant]`
pub fn platform_string(platform: &Platform) -> String {
    match platform.variant.as_deref() {
        Some(variant) if !variant.is_empty() => {
            format!("{}/{}/{}", platform.os, platform.architecture, variant)
        }
        _ => format!("{}/{}", platform.os, platform.architecture),
    }
}

/// Lists the platforms an image's manifest list provides
#[async_trait]
pub trait ManifestInspector: Send + Sync {
    /// Returns the `os/arch[/variant]` strings of the image index
    ///
    /// Fails with [`InspectError::NotAList`] when the reference resolves to a
    /// single-platform manifest.
    async fn platforms(
        &self,
        image: &str,
        hosts: &[RegistryHost],
    ) -> Result<Vec<String>, InspectError>;
}

/// Manifest inspector backed by the OCI distribution API
///
/// A fresh client is built per lookup so bearer tokens obtained with one
/// workload's credentials are never reused for another's.
#[derive(Debug, Clone, Default)]
pub struct OciManifestInspector;

impl OciManifestInspector {
    pub fn new() -> Self {
        Self
    }

    fn auth_for(reference: &Reference, hosts: &[RegistryHost]) -> RegistryAuth {
        let registry = normalize_host(reference.registry());
        hosts
            .iter()
            .find(|h| normalize_host(&h.host) == registry)
            .map_or(RegistryAuth::Anonymous, RegistryHost::auth)
    }
}

#[async_trait]
impl ManifestInspector for OciManifestInspector {
    async fn platforms(
        &self,
        image: &str,
        hosts: &[RegistryHost],
    ) -> Result<Vec<String>, InspectError> {
        let reference = image
            .parse::<Reference>()
            .map_err(|err| InspectError::InvalidReference {
                reference: image.to_owned(),
                reason: err.to_string(),
            })?;

        let auth = Self::auth_for(&reference, hosts);
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });

        let (manifest, digest) = client.pull_manifest(&reference, &auth).await?;
        debug!(image, digest = %digest, "pulled manifest");

        match manifest {
            OciManifest::ImageIndex(index) => Ok(index
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(platform_string)
                .collect()),
            OciManifest::Image(_) => Err(InspectError::NotAList(image.to_owned())),
        }
    }
}
