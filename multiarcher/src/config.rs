//! Configuration loaded once at startup
//!
//! All values come from the process environment. Loaders take a lookup
//! function instead of reading `std::env` directly so they can be exercised
//! without touching process state.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::Toleration;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::filter::NamespaceFilter;

pub const DEFAULT_PLATFORM: &str = "linux/arm64";
pub const DEFAULT_TOLERATION_KEY: &str = "k8smultiarcher";
pub const DEFAULT_TOLERATION_VALUE: &str = "arm64Supported";

pub const CACHE_SIZE_DEFAULT: usize = 100_000;
pub const REDIS_ADDR_DEFAULT: &str = "localhost:6379";
pub const REQUEST_TIMEOUT_DEFAULT: Duration = Duration::from_secs(25);

/// Toleration operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

impl TolerationOperator {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "Equal",
            Self::Exists => "Exists",
        }
    }

    /// Parses an operator, falling back to `Equal` on empty or invalid input
    pub fn parse_or_default(raw: &str) -> Self {
        match raw {
            "" | "Equal" => Self::Equal,
            "Exists" => Self::Exists,
            other => {
                error!(operator = other, "invalid toleration operator, using default Equal");
                Self::Equal
            }
        }
    }
}

impl fmt::Display for TolerationOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taint effect a toleration matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaintEffect {
    #[default]
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoSchedule => "NoSchedule",
            Self::PreferNoSchedule => "PreferNoSchedule",
            Self::NoExecute => "NoExecute",
        }
    }

    /// Parses an effect, falling back to `NoSchedule` on empty or invalid input
    pub fn parse_or_default(raw: &str) -> Self {
        match raw {
            "" | "NoSchedule" => Self::NoSchedule,
            "PreferNoSchedule" => Self::PreferNoSchedule,
            "NoExecute" => Self::NoExecute,
            other => {
                error!(effect = other, "invalid toleration effect, using default NoSchedule");
                Self::NoSchedule
            }
        }
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated toleration injected for a platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TolerationSpec {
    key: String,
    value: String,
    operator: TolerationOperator,
    effect: TaintEffect,
}

impl TolerationSpec {
    /// Builds a toleration, returning `None` when `key` is empty
    ///
    /// A value paired with the `Exists` operator is dropped since the API
    /// server rejects that combination.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        operator: TolerationOperator,
        effect: TaintEffect,
    ) -> Option<Self> {
        let key = key.into();
        if key.is_empty() {
            return None;
        }

        let mut value = value.into();
        if operator == TolerationOperator::Exists && !value.is_empty() {
            warn!(key = %key, value = %value, "toleration value ignored for Exists operator");
            value.clear();
        }

        Some(Self {
            key,
            value,
            operator,
            effect,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub const fn operator(&self) -> TolerationOperator {
        self.operator
    }

    pub const fn effect(&self) -> TaintEffect {
        self.effect
    }

    /// Whether `toleration` has the same key, value, operator and effect
    ///
    /// Unset fields on the workload side compare equal to empty strings.
    pub fn matches(&self, toleration: &Toleration) -> bool {
        toleration.key.as_deref().unwrap_or_default() == self.key
            && toleration.value.as_deref().unwrap_or_default() == self.value
            && toleration.operator.as_deref().unwrap_or_default() == self.operator.as_str()
            && toleration.effect.as_deref().unwrap_or_default() == self.effect.as_str()
    }

    pub fn to_toleration(&self) -> Toleration {
        Toleration {
            key: Some(self.key.clone()),
            value: (!self.value.is_empty()).then(|| self.value.clone()),
            operator: Some(self.operator.as_str().to_owned()),
            effect: Some(self.effect.as_str().to_owned()),
            toleration_seconds: None,
        }
    }
}

/// A single platform to toleration mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformTolerationMapping {
    pub platform: String,
    pub toleration: TolerationSpec,
}

impl PlatformTolerationMapping {
    pub fn new(platform: impl Into<String>, toleration: TolerationSpec) -> Self {
        Self {
            platform: platform.into(),
            toleration,
        }
    }
}

/// Raw mapping as it appears in `PLATFORM_TOLERATIONS`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMapping {
    platform: String,
    key: String,
    value: String,
    operator: String,
    effect: String,
}

impl RawMapping {
    fn validate(self) -> Option<PlatformTolerationMapping> {
        let platform = if self.platform.is_empty() {
            warn!(
                key = %self.key,
                "toleration mapping without platform, using default {DEFAULT_PLATFORM}"
            );
            DEFAULT_PLATFORM.to_owned()
        } else {
            self.platform
        };

        let Some(toleration) = TolerationSpec::new(
            self.key,
            self.value,
            TolerationOperator::parse_or_default(&self.operator),
            TaintEffect::parse_or_default(&self.effect),
        ) else {
            error!(platform = %platform, "toleration mapping without key, ignoring");
            return None;
        };

        Some(PlatformTolerationMapping::new(platform, toleration))
    }
}

/// Ordered platform to toleration mappings
///
/// Mapping order defines the order in which platforms are checked and
/// tolerations appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformTolerationConfig {
    mappings: Vec<PlatformTolerationMapping>,
}

impl Default for PlatformTolerationConfig {
    fn default() -> Self {
        let mappings = TolerationSpec::new(
            DEFAULT_TOLERATION_KEY,
            DEFAULT_TOLERATION_VALUE,
            TolerationOperator::Equal,
            TaintEffect::NoSchedule,
        )
        .map(|toleration| PlatformTolerationMapping::new(DEFAULT_PLATFORM, toleration))
        .into_iter()
        .collect();

        Self { mappings }
    }
}

impl PlatformTolerationConfig {
    pub fn new(mappings: Vec<PlatformTolerationMapping>) -> Self {
        Self { mappings }
    }

    /// Loads mappings from the advanced JSON form, then the simple form,
    /// then falls back to the default mapping
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let config = Self::from_json(&lookup)
            .or_else(|| Self::from_simple(&lookup))
            .unwrap_or_else(|| {
                let config = Self::default();
                for mapping in &config.mappings {
                    info!(
                        platform = %mapping.platform,
                        key = %mapping.toleration.key(),
                        "using default platform-toleration mapping"
                    );
                }
                config
            });

        for mapping in &config.mappings {
            info!(
                platform = %mapping.platform,
                key = %mapping.toleration.key(),
                value = %mapping.toleration.value(),
                operator = %mapping.toleration.operator(),
                effect = %mapping.toleration.effect(),
                "configured platform-toleration mapping"
            );
        }

        config
    }

    fn from_json(lookup: &impl Fn(&str) -> Option<String>) -> Option<Self> {
        let raw = lookup("PLATFORM_TOLERATIONS").filter(|raw| !raw.is_empty())?;

        let mappings: Vec<RawMapping> = match serde_json::from_str(&raw) {
            Ok(mappings) => mappings,
            Err(err) => {
                error!(error = %err, "failed to parse PLATFORM_TOLERATIONS, ignoring JSON config");
                return None;
            }
        };

        let mappings: Vec<_> = mappings.into_iter().filter_map(RawMapping::validate).collect();
        if mappings.is_empty() {
            return None;
        }

        info!(count = mappings.len(), "loaded platform-toleration mappings from JSON");
        Some(Self { mappings })
    }

    fn from_simple(lookup: &impl Fn(&str) -> Option<String>) -> Option<Self> {
        let key = lookup("TOLERATION_KEY").filter(|key| !key.is_empty())?;
        let get = |name: &str| lookup(name).unwrap_or_default();

        let mapping = RawMapping {
            platform: get("TOLERATION_PLATFORM"),
            key,
            value: get("TOLERATION_VALUE"),
            operator: get("TOLERATION_OPERATOR"),
            effect: get("TOLERATION_EFFECT"),
        }
        .validate()?;

        info!("loaded platform-toleration mapping from simple env vars");
        Some(Self {
            mappings: vec![mapping],
        })
    }

    pub fn mappings(&self) -> &[PlatformTolerationMapping] {
        &self.mappings
    }

    /// Configured platforms in mapping order
    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.mappings.iter().map(|m| m.platform.as_str())
    }

    /// Tolerations of every mapping whose platform is supported, in mapping order
    pub fn tolerations_for<'a>(
        &'a self,
        supported: &'a [String],
    ) -> impl Iterator<Item = &'a TolerationSpec> + 'a {
        self.mappings
            .iter()
            .filter(|m| supported.iter().any(|p| *p == m.platform))
            .map(|m| &m.toleration)
    }
}

/// Cache backend selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    InMemory { size: usize },
    Redis { addr: String },
}

impl CacheBackend {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let size = match lookup("CACHE_SIZE").filter(|s| !s.is_empty()) {
            None => CACHE_SIZE_DEFAULT,
            Some(raw) => match raw.parse::<usize>() {
                Ok(size) if size > 0 => size,
                _ => return Err(Error::Config(format!("invalid cache size: {raw}"))),
            },
        };

        let choice = lookup("CACHE").filter(|c| !c.is_empty());
        match choice.as_deref().unwrap_or("inmemory") {
            "inmemory" => Ok(Self::InMemory { size }),
            "redis" => {
                let addr = lookup("REDIS_ADDR")
                    .filter(|a| !a.is_empty())
                    .unwrap_or_else(|| REDIS_ADDR_DEFAULT.to_owned());
                Ok(Self::Redis { addr })
            }
            other => Err(Error::Config(format!("invalid cache choice: {other}"))),
        }
    }
}

/// TLS certificate and key locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert_path: String,
    pub key_path: String,
}

/// Listener settings for the webhook server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsSettings>,
    pub request_timeout: Duration,
}

impl ServerSettings {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let tls = (get("TLS_ENABLED").as_deref() == Some("true")).then(|| TlsSettings {
            cert_path: get("CERT_PATH").unwrap_or_else(|| "./certs/tls.crt".to_owned()),
            key_path: get("KEY_PATH").unwrap_or_else(|| "./certs/tls.key".to_owned()),
        });

        let port = match get("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid port: {raw}")))?,
            None if tls.is_some() => 8443,
            None => 8080,
        };

        let request_timeout = match get("REQUEST_TIMEOUT_SECONDS") {
            Some(raw) => raw
                .parse()
                .map(Duration::from_secs)
                .map_err(|_| Error::Config(format!("invalid request timeout: {raw}")))?,
            None => REQUEST_TIMEOUT_DEFAULT,
        };

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port,
            tls,
            request_timeout,
        })
    }

    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Everything the webhook reads from its environment
#[derive(Debug, Clone)]
pub struct Settings {
    pub platforms: PlatformTolerationConfig,
    pub cache: CacheBackend,
    pub namespaces: NamespaceFilter,
    pub server: ServerSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            platforms: PlatformTolerationConfig::from_lookup(&lookup),
            cache: CacheBackend::from_lookup(&lookup)?,
            namespaces: NamespaceFilter::from_lookup(&lookup),
            server: ServerSettings::from_lookup(&lookup)?,
        })
    }
}
