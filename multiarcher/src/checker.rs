use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, error};

use crate::cache::{CacheKey, PlatformCache};
use crate::error::InspectError;
use crate::registry::{ManifestInspector, RegistryHost};

pub const REGISTRY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// TTL of a confirmed match
pub const CACHE_SUCCESS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// TTL of a manifest list that lacks the platform
pub const CACHE_NEGATIVE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// TTL of a lookup that could not be completed
pub const CACHE_FAILURE_TTL: Duration = Duration::from_secs(5 * 60);

/// Answers whether an image supports a platform, memoizing the answer
///
/// Lookup failures count as "unsupported" but are cached only briefly so a
/// registry outage does not pin images as unsupported for hours.
#[derive(Clone)]
pub struct ManifestPlatformChecker {
    cache: Arc<dyn PlatformCache>,
    inspector: Arc<dyn ManifestInspector>,
    request_timeout: Duration,
}

impl ManifestPlatformChecker {
    pub fn new(cache: Arc<dyn PlatformCache>, inspector: Arc<dyn ManifestInspector>) -> Self {
        Self {
            cache,
            inspector,
            request_timeout: REGISTRY_REQUEST_TIMEOUT,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub async fn supports(&self, image: &str, platform: &str, hosts: &[RegistryHost]) -> bool {
        let key = CacheKey::new(image, platform);
        if let Some(supported) = self.cache.get(&key).await {
            debug!(image, platform, supported, "platform support cache hit");
            return supported;
        }

        let platforms = match self.inspect(image, hosts).await {
            Ok(platforms) => platforms,
            Err(err) => {
                error!(image, platform, error = %err, "failed to get manifest platforms");
                self.cache.set(&key, false, CACHE_FAILURE_TTL).await;
                return false;
            }
        };

        // exact match, "linux/arm" does not match "linux/arm/v7"
        let supported = platforms.iter().any(|p| p == platform);
        let ttl = if supported {
            CACHE_SUCCESS_TTL
        } else {
            CACHE_NEGATIVE_TTL
        };
        self.cache.set(&key, supported, ttl).await;

        debug!(image, platform, supported, available = ?platforms, "resolved platform support");
        supported
    }

    async fn inspect(
        &self,
        image: &str,
        hosts: &[RegistryHost],
    ) -> Result<Vec<String>, InspectError> {
        timeout(self.request_timeout, self.inspector.platforms(image, hosts))
            .await
            .map_err(|_| InspectError::Timeout(self.request_timeout))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::cache::AdaptiveCache;

    /// Inspector answering from a fixed image table and counting calls
    #[derive(Default)]
    pub(crate) struct StaticInspector {
        images: HashMap<String, Vec<String>>,
        failing: Vec<String>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl StaticInspector {
        pub(crate) fn with_image(mut self, image: &str, platforms: &[&str]) -> Self {
            self.images.insert(
                image.to_owned(),
                platforms.iter().map(|p| p.to_string()).collect(),
            );
            self
        }

        pub(crate) fn with_failure(mut self, image: &str) -> Self {
            self.failing.push(image.to_owned());
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ManifestInspector for StaticInspector {
        async fn platforms(
            &self,
            image: &str,
            _hosts: &[RegistryHost],
        ) -> Result<Vec<String>, InspectError> {
            self.calls.lock().unwrap().push(image.to_owned());
            if self.failing.iter().any(|i| i == image) {
                return Err(InspectError::InvalidReference {
                    reference: image.to_owned(),
                    reason: "simulated registry failure".into(),
                });
            }
            self.images
                .get(image)
                .cloned()
                .ok_or_else(|| InspectError::NotAList(image.to_owned()))
        }
    }

    struct HangingInspector;

    #[async_trait]
    impl ManifestInspector for HangingInspector {
        async fn platforms(
            &self,
            _image: &str,
            _hosts: &[RegistryHost],
        ) -> Result<Vec<String>, InspectError> {
            std::future::pending().await
        }
    }

    fn checker(
        inspector: StaticInspector,
    ) -> (ManifestPlatformChecker, Arc<AdaptiveCache>, Arc<StaticInspector>) {
        let cache = Arc::new(AdaptiveCache::new(100));
        let inspector = Arc::new(inspector);
        let checker = ManifestPlatformChecker::new(cache.clone(), inspector.clone());
        (checker, cache, inspector)
    }

    #[tokio::test]
    async fn test_cache_hit_skips_inspection() {
        let (checker, cache, inspector) = checker(StaticInspector::default());
        cache
            .set(&CacheKey::new("image_with_arm_support", "linux/arm64"), true, Duration::ZERO)
            .await;
        cache
            .set(
                &CacheKey::new("image_without_arm_support", "linux/arm64"),
                false,
                Duration::ZERO,
            )
            .await;

        assert!(checker.supports("image_with_arm_support", "linux/arm64", &[]).await);
        assert!(!checker.supports("image_without_arm_support", "linux/arm64", &[]).await);
        assert_eq!(inspector.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_support_uses_long_ttl() {
        let inspector =
            StaticInspector::default().with_image("nginx", &["linux/amd64", "linux/arm64"]);
        let (checker, cache, inspector) = checker(inspector);

        assert!(checker.supports("nginx", "linux/arm64", &[]).await);
        assert!(checker.supports("nginx", "linux/arm64", &[]).await);
        assert_eq!(inspector.call_count(), 1);

        let key = CacheKey::new("nginx", "linux/arm64");
        tokio::time::advance(CACHE_SUCCESS_TTL - Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key).await, Some(true));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_non_support_uses_negative_ttl() {
        let (checker, cache, _) =
            checker(StaticInspector::default().with_image("amd-only", &["linux/amd64"]));

        assert!(!checker.supports("amd-only", "linux/arm64", &[]).await);

        let key = CacheKey::new("amd-only", "linux/arm64");
        tokio::time::advance(CACHE_NEGATIVE_TTL - Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key).await, Some(false));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_failure_uses_failure_ttl() {
        let (checker, cache, inspector) =
            checker(StaticInspector::default().with_failure("flaky"));

        assert!(!checker.supports("flaky", "linux/arm64", &[]).await);
        assert!(!checker.supports("flaky", "linux/arm64", &[]).await);
        assert_eq!(inspector.call_count(), 1);

        tokio::time::advance(CACHE_FAILURE_TTL).await;
        assert_eq!(cache.get(&CacheKey::new("flaky", "linux/arm64")).await, None);

        assert!(!checker.supports("flaky", "linux/arm64", &[]).await);
        assert_eq!(inspector.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_platform_manifest_is_a_failure() {
        // unknown images answer NotAList
        let (checker, cache, _) = checker(StaticInspector::default());

        assert!(!checker.supports("single-arch", "linux/amd64", &[]).await);

        tokio::time::advance(CACHE_FAILURE_TTL).await;
        assert_eq!(
            cache.get(&CacheKey::new("single-arch", "linux/amd64")).await,
            None
        );
    }

    #[tokio::test]
    async fn test_exact_platform_match() {
        let (checker, _, _) =
            checker(StaticInspector::default().with_image("arm-v7", &["linux/arm/v7"]));

        assert!(!checker.supports("arm-v7", "linux/arm", &[]).await);
        assert!(checker.supports("arm-v7", "linux/arm/v7", &[]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inspection_timeout() {
        let cache = Arc::new(AdaptiveCache::new(10));
        let checker = ManifestPlatformChecker::new(cache.clone(), Arc::new(HangingInspector))
            .with_request_timeout(Duration::from_secs(1));

        assert!(!checker.supports("slow", "linux/arm64", &[]).await);
        assert_eq!(
            cache.get(&CacheKey::new("slow", "linux/arm64")).await,
            Some(false)
        );
    }
}
