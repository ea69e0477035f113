use k8s_openapi::api::core::v1::PodSpec;
use tracing::{debug, info};

use crate::checker::ManifestPlatformChecker;
use crate::config::PlatformTolerationConfig;
use crate::registry::RegistryHost;

/// The part of a container that platform resolution looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub name: String,
    pub image: Option<String>,
}

impl ContainerImage {
    pub fn new(name: impl Into<String>, image: Option<String>) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }
}

/// Regular, init and ephemeral containers of a pod spec, in that order
pub fn containers(spec: &PodSpec) -> Vec<ContainerImage> {
    let regular = spec.containers.iter().map(|c| (&c.name, &c.image));
    let init = spec.init_containers.iter().flatten().map(|c| (&c.name, &c.image));
    let ephemeral = spec
        .ephemeral_containers
        .iter()
        .flatten()
        .map(|c| (&c.name, &c.image));

    regular
        .chain(init)
        .chain(ephemeral)
        .map(|(name, image)| ContainerImage::new(name.clone(), image.clone()))
        .collect()
}

/// Computes the configured platforms every container image supports
#[derive(Clone)]
pub struct WorkloadPlatformResolver {
    checker: ManifestPlatformChecker,
}

impl WorkloadPlatformResolver {
    pub fn new(checker: ManifestPlatformChecker) -> Self {
        Self { checker }
    }

    /// Supported platforms in configuration order
    ///
    /// A platform is kept only if every container supports it. An empty
    /// container list supports nothing.
    pub async fn supported_platforms(
        &self,
        containers: &[ContainerImage],
        hosts: &[RegistryHost],
        config: &PlatformTolerationConfig,
    ) -> Vec<String> {
        if containers.is_empty() {
            return Vec::new();
        }

        let mut supported = Vec::new();
        for platform in config.platforms() {
            match self.first_unsupported(containers, platform, hosts).await {
                None => supported.push(platform.to_owned()),
                Some(container) => info!(
                    platform,
                    container = %container.name,
                    image = container.image.as_deref().unwrap_or_default(),
                    "container image lacks platform support"
                ),
            }
        }

        debug!(supported = ?supported, "resolved supported platforms");
        supported
    }

    async fn first_unsupported<'a>(
        &self,
        containers: &'a [ContainerImage],
        platform: &str,
        hosts: &[RegistryHost],
    ) -> Option<&'a ContainerImage> {
        for container in containers {
            let supported = match container.image.as_deref().filter(|i| !i.is_empty()) {
                Some(image) => self.checker.supports(image, platform, hosts).await,
                None => false,
            };
            if !supported {
                return Some(container);
            }
        }
        None
    }
}
