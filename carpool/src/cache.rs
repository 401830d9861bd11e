//! Best-effort, TTL-bounded cache over Redis, using the same
//! `redis::aio::ConnectionManager` connection-pooling pattern as the
//! teacher's `RedisSessionStore`. Unlike that session store, a cache miss
//! or backend outage here is never an error: every method swallows
//! connection failures into the no-op behavior the specification requires
//! ("miss" on get, success on set/del) so no caller can fail because the
//! cache is down.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

/// A TTL-bounded cache that degrades to no-ops when Redis is unreachable.
pub trait CacheLayer: Send + Sync {
    fn get(
        &self,
        key: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<Vec<u8>>> + Send + '_>>;

    fn set_ex(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;

    fn del(&self, key: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;

    /// Deletes every key matching a glob pattern (e.g. `notifications:*`).
    fn del_glob(
        &self,
        pattern: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;
}

#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
}

impl RedisCache {
    /// # Errors
    ///
    /// Returns an error if the initial connection to Redis fails. Later,
    /// per-call failures never surface as errors — they degrade to no-ops.
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self { conn_manager })
    }
}

impl CacheLayer for RedisCache {
    fn get(
        &self,
        key: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<Vec<u8>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            match conn.get::<_, Option<Vec<u8>>>(&key).await {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(%key, error = %err, "cache get failed, treating as miss");
                    None
                }
            }
        })
    }

    fn set_ex(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let ttl_seconds = ttl.as_secs().max(1);
            if let Err(err) = conn.set_ex::<_, _, ()>(&key, value, ttl_seconds).await {
                tracing::warn!(%key, error = %err, "cache set failed, ignoring");
            }
        })
    }

    fn del(&self, key: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            if let Err(err) = conn.del::<_, ()>(&key).await {
                tracing::warn!(%key, error = %err, "cache del failed, ignoring");
            }
        })
    }

    fn del_glob(
        &self,
        pattern: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        let pattern = pattern.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let keys: Vec<String> = match conn.keys(&pattern).await {
                Ok(keys) => keys,
                Err(err) => {
                    tracing::warn!(%pattern, error = %err, "cache keys scan failed, ignoring");
                    return;
                }
            };
            if keys.is_empty() {
                return;
            }
            if let Err(err) = conn.del::<_, ()>(&keys).await {
                tracing::warn!(%pattern, error = %err, "cache bulk del failed, ignoring");
            }
        })
    }
}

/// No-op cache, used when no `REDIS_URL` is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCache;

impl CacheLayer for NoopCache {
    fn get(
        &self,
        _key: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<Vec<u8>>> + Send + '_>> {
        Box::pin(async { None })
    }

    fn set_ex(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }

    fn del(&self, _key: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }

    fn del_glob(
        &self,
        _pattern: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_cache_always_misses() {
        let cache = NoopCache;
        cache
            .set_ex("notifications:u1", b"x".to_vec(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("notifications:u1").await, None);
    }
}
