//! Mutating admission webhook for multi-platform scheduling
//!
//! For every admitted Pod or DaemonSet, multiarcher checks which configured
//! platforms all container images provide in their manifest lists and adds
//! the tolerations mapped to those platforms, so the workload can land on
//! nodes tainted for them.

pub mod admission;
pub mod cache;
pub mod checker;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod error;
pub mod filter;
pub mod platforms;
pub mod registry;
pub mod server;
pub mod tolerations;

pub use admission::{AdmissionEngine, MutatingAdmissionHandler};
pub use cache::{AdaptiveCache, CacheKey, PlatformCache, RedisCache};
pub use checker::ManifestPlatformChecker;
pub use cluster::{ClusterAccess, ClusterReader, KubeReader};
pub use config::{PlatformTolerationConfig, PlatformTolerationMapping, Settings, TolerationSpec};
pub use credentials::RegistryCredentialResolver;
pub use error::{AdmissionError, ClusterReadError, Error, InspectError, Result};
pub use filter::NamespaceFilter;
pub use platforms::WorkloadPlatformResolver;
pub use registry::{ManifestInspector, OciManifestInspector, RegistryHost};
