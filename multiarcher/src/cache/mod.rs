//! Memoization of image platform support
//!
//! Both backends implement [`PlatformCache`]. Lookups never fail: a backend
//! that cannot answer reports a miss, and a backend that cannot store logs
//! the failure and drops the value.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

mod adaptive;
mod remote;

pub use self::adaptive::AdaptiveCache;
pub use self::remote::RedisCache;

use crate::config::CacheBackend;

/// Identifies a cached support decision
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    image: String,
    platform: String,
}

impl CacheKey {
    pub fn new(image: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            platform: platform.into(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.image, self.platform)
    }
}

/// TTL key/value store for platform support results
///
/// A zero `ttl` stores the value without expiry.
#[async_trait]
pub trait PlatformCache: Send + Sync {
    /// Returns the stored value, or `None` when absent, expired or unreadable
    async fn get(&self, key: &CacheKey) -> Option<bool>;

    /// Stores a value
    async fn set(&self, key: &CacheKey, value: bool, ttl: Duration);
}

#[async_trait]
impl<C> PlatformCache for Arc<C>
where
    C: PlatformCache + ?Sized,
{
    async fn get(&self, key: &CacheKey) -> Option<bool> {
        (**self).get(key).await
    }

    async fn set(&self, key: &CacheKey, value: bool, ttl: Duration) {
        (**self).set(key, value, ttl).await
    }
}

/// Builds the backend selected by configuration
pub fn from_backend(backend: &CacheBackend) -> crate::Result<Arc<dyn PlatformCache>> {
    match backend {
        CacheBackend::InMemory { size } => {
            tracing::info!(size, "using in-memory cache");
            Ok(Arc::new(AdaptiveCache::new(*size)))
        }
        CacheBackend::Redis { addr } => {
            tracing::info!(addr = %addr, "using redis cache");
            Ok(Arc::new(RedisCache::new(addr)?))
        }
    }
}
