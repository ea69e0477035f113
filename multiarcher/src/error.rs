use thiserror::Error;

/// Errors that can occur while starting the webhook
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value
    #[error("Config Error: {0}")]
    Config(String),

    /// Error from the redis client
    #[error("Redis Error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Error binding or reading server resources
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort an admission review
///
/// These cover malformed input and patch construction. Upstream failures
/// (registry, Kubernetes API) never surface here; they are folded into an
/// "unsupported" outcome by the checker and the credential resolver.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Request body is not an admission review
    #[error("failed to decode admission review: {0}")]
    Decode(#[source] serde_json::Error),

    /// Admission review without a request
    #[error("invalid admission request: {0}")]
    InvalidRequest(String),

    /// Object kind this webhook does not handle
    #[error("got a request for an unsupported kind: {0}")]
    UnsupportedKind(String),

    /// Admission request without an embedded object
    #[error("admission request for {0} carries no object")]
    MissingObject(String),

    /// Embedded object does not match the expected schema
    #[error("failed to decode {kind}: {source}")]
    ObjectDecode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Original or mutated object could not be serialized
    #[error("failed to serialize {kind}: {source}")]
    Serialize {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// JSON patch could not be attached to the response
    #[error("failed to create patch: {0}")]
    Patch(String),
}

/// Errors from manifest inspection
#[derive(Error, Debug)]
pub enum InspectError {
    #[error("invalid image reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("registry error: {0}")]
    Registry(#[from] oci_distribution::errors::OciDistributionError),

    #[error("image {0} has no manifest list")]
    NotAList(String),

    #[error("manifest lookup timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors from Kubernetes reads
#[derive(Error, Debug)]
pub enum ClusterReadError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Kube Error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubernetes client unavailable: {0}")]
    Unavailable(String),
}

/// Errors decoding a single image pull secret or auth entry
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("missing {0}")]
    MissingKey(&'static str),

    #[error("unsupported secret type {0:?}")]
    UnsupportedType(Option<String>),

    #[error("invalid docker config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 auth: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid auth format, expected format username:password")]
    AuthFormat,
}

/// Result type for startup operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
