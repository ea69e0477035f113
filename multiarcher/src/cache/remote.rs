use std::time::Duration;

use async_trait::async_trait;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::{CacheKey, PlatformCache};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
const KEY_PREFIX: &str = "multiarcher:v1";

/// Cache shared between replicas through a redis server
///
/// The connection is established on first use and re-established by the
/// connection manager after failures.
pub struct RedisCache {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisCache {
    /// Accepts `host:port` or a full `redis://` URL
    pub fn new(addr: &str) -> RedisResult<Self> {
        let url = if addr.contains("://") {
            addr.to_owned()
        } else {
            format!("redis://{addr}")
        };

        Ok(Self {
            client: redis::Client::open(url)?,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> RedisResult<ConnectionManager> {
        self.connection
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .cloned()
    }

    async fn fetch(&self, key: &str) -> RedisResult<Option<String>> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await
    }

    async fn store(&self, key: &str, value: bool, ttl: Duration) -> RedisResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(encode_value(value));
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<()>(&mut conn).await
    }
}

/// Length-prefixing the image keeps distinct (image, platform) pairs from
/// colliding on the `:` separator.
fn encode_key(key: &CacheKey) -> String {
    format!(
        "{KEY_PREFIX}:{}:{}:{}",
        key.image().len(),
        key.image(),
        key.platform()
    )
}

const fn encode_value(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn decode_value(raw: &str) -> Option<bool> {
    match raw {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl PlatformCache for RedisCache {
    async fn get(&self, key: &CacheKey) -> Option<bool> {
        let encoded = encode_key(key);

        match timeout(OPERATION_TIMEOUT, self.fetch(&encoded)).await {
            Ok(Ok(Some(raw))) => {
                let value = decode_value(&raw);
                if value.is_none() {
                    error!(key = %key, "found non boolean cache value");
                }
                value
            }
            Ok(Ok(None)) => None,
            Ok(Err(err)) => {
                debug!(key = %key, error = %err, "failed to get key on RedisCache");
                None
            }
            Err(_) => {
                warn!(key = %key, "get on RedisCache timed out");
                None
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: bool, ttl: Duration) {
        let encoded = encode_key(key);

        match timeout(OPERATION_TIMEOUT, self.store(&encoded, value, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(key = %key, error = %err, "failed to set key on RedisCache"),
            Err(_) => warn!(key = %key, "set on RedisCache timed out"),
        }
    }
}
