/// Redis-backed result cache for assembled read views
///
/// Caches the expensive read-path products:
/// - Assembled thread trees (viewer-scoped keys)
/// - Thread context summaries
/// - Deep reply counts
/// - Gate evaluation context (root author follows, list members)
///
/// The cache is strictly an accelerator. Every backend failure is logged
/// and treated as a miss so an outage degrades latency, never correctness.
use crate::config::CacheConfig;
use crate::error::{AppViewError, AppViewResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Cache namespace constants
pub mod namespaces {
    pub const THREAD: &str = "thread:";
    pub const THREAD_CONTEXT: &str = "threadctx:";
    pub const REPLY_COUNT: &str = "replycount:";
    pub const GATE: &str = "gate:";
}

/// Escape one component of a composite cache key so URIs and DIDs cannot
/// collide with the `:` separators around them
pub fn encode_key_part(part: &str) -> String {
    urlencoding::encode(part).into_owned()
}

/// Storage seam under [`ResultCache`]
///
/// Values are opaque JSON strings at this level; typing lives in the
/// wrapper. Implementations must be safe to share across tasks.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_raw(&self, key: &str) -> AppViewResult<Option<String>>;

    async fn set_raw(&self, key: &str, value: &str, ttl_secs: u64) -> AppViewResult<()>;

    async fn delete(&self, key: &str) -> AppViewResult<()>;

    /// Delete every key starting with `prefix`, returning how many went
    async fn delete_prefix(&self, prefix: &str) -> AppViewResult<u64>;

    async fn ping(&self) -> AppViewResult<()>;
}

/// Redis cache backend
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis using the cache configuration
    pub async fn connect(config: &CacheConfig) -> AppViewResult<Self> {
        info!("Connecting to Redis at {}", config.redis_url);

        let client = Client::open(config.redis_url.as_str()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppViewError::Cache(format!("Redis client creation failed: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            AppViewError::Cache(format!("Redis connection failed: {}", e))
        })?;

        info!("✓ Redis connection established");

        Ok(Self { connection })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get_raw(&self, key: &str) -> AppViewResult<Option<String>> {
        let mut conn = self.connection.clone();
        let result: Option<String> = conn.get(key).await.map_err(|e| {
            AppViewError::Cache(format!("Redis GET failed for {}: {}", key, e))
        })?;
        Ok(result)
    }

    async fn set_raw(&self, key: &str, value: &str, ttl_secs: u64) -> AppViewResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await.map_err(|e| {
            AppViewError::Cache(format!("Redis SET failed for {}: {}", key, e))
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppViewResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await.map_err(|e| {
            AppViewError::Cache(format!("Redis DELETE failed for {}: {}", key, e))
        })?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> AppViewResult<u64> {
        let pattern = format!("{}*", prefix);
        let mut conn = self.connection.clone();

        let keys: Vec<String> = conn.keys(&pattern).await.map_err(|e| {
            AppViewError::Cache(format!("Redis KEYS failed for {}: {}", pattern, e))
        })?;

        if keys.is_empty() {
            return Ok(0);
        }

        let deleted: u64 = conn.del(&keys).await.map_err(|e| {
            AppViewError::Cache(format!("Redis DELETE multiple keys failed: {}", e))
        })?;

        Ok(deleted)
    }

    async fn ping(&self) -> AppViewResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| AppViewError::Cache(format!("Redis PING failed: {}", e)))?;

        if pong != "PONG" {
            return Err(AppViewError::Cache(
                "Unexpected Redis PING response".to_string(),
            ));
        }

        Ok(())
    }
}

/// In-memory cache backend for tests and single-process deployments
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get_raw(&self, key: &str) -> AppViewResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|(value, expires_at)| {
            if Instant::now() < *expires_at {
                Some(value.clone())
            } else {
                None
            }
        }))
    }

    async fn set_raw(&self, key: &str, value: &str, ttl_secs: u64) -> AppViewResult<()> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppViewResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> AppViewResult<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }

    async fn ping(&self) -> AppViewResult<()> {
        Ok(())
    }
}

/// Typed, namespaced cache over a [`CacheBackend`]
///
/// Values are serialized as JSON. Keys take the shape
/// `{prefix}{namespace}{key}`. When built without a backend every read is
/// a miss and every write is a no-op, so callers never branch on whether
/// caching is turned on.
#[derive(Clone)]
pub struct ResultCache {
    backend: Option<Arc<dyn CacheBackend>>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend: Some(backend),
            config,
        }
    }

    /// A cache that never hits, for deployments without Redis
    pub fn disabled() -> Self {
        Self {
            backend: None,
            config: CacheConfig::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn build_key(&self, namespace: &str, key: &str) -> String {
        format!("{}{}{}", self.config.key_prefix, namespace, key)
    }

    /// Get a value, treating every backend failure as a miss
    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;
        let cache_key = self.build_key(namespace, key);

        let raw = match backend.get_raw(&cache_key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cache read failed, serving without cache: {}", e);
                crate::metrics::record_cache_error(namespace);
                return None;
            }
        };

        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => {
                    debug!("Cache HIT: {}", cache_key);
                    crate::metrics::record_cache_hit(namespace);
                    Some(value)
                }
                Err(e) => {
                    warn!("Dropping undeserializable cache entry {}: {}", cache_key, e);
                    let _ = backend.delete(&cache_key).await;
                    crate::metrics::record_cache_miss(namespace);
                    None
                }
            },
            None => {
                debug!("Cache MISS: {}", cache_key);
                crate::metrics::record_cache_miss(namespace);
                None
            }
        }
    }

    /// Store a value with a TTL; backend failures are logged and swallowed
    pub async fn set<T: Serialize>(&self, namespace: &str, key: &str, value: &T, ttl_secs: u64) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let cache_key = self.build_key(namespace, key);

        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize cache value for {}: {}", cache_key, e);
                return;
            }
        };

        debug!("Cache SET: {} (TTL: {}s)", cache_key, ttl_secs);
        if let Err(e) = backend.set_raw(&cache_key, &json, ttl_secs).await {
            warn!("Cache write failed, continuing uncached: {}", e);
            crate::metrics::record_cache_error(namespace);
        }
    }

    /// Drop a single entry
    pub async fn invalidate(&self, namespace: &str, key: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let cache_key = self.build_key(namespace, key);
        if let Err(e) = backend.delete(&cache_key).await {
            warn!("Cache invalidation failed for {}: {}", cache_key, e);
            crate::metrics::record_cache_error(namespace);
        }
    }

    /// Drop every entry in a namespace whose key starts with `key_prefix`.
    /// Used to clear all viewer variants of one thread in one call.
    pub async fn invalidate_prefix(&self, namespace: &str, key_prefix: &str) -> u64 {
        let Some(backend) = self.backend.as_ref() else {
            return 0;
        };
        let full_prefix = self.build_key(namespace, key_prefix);
        match backend.delete_prefix(&full_prefix).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!("Cache invalidated {} keys under {}", deleted, full_prefix);
                }
                deleted
            }
            Err(e) => {
                warn!("Cache prefix invalidation failed for {}: {}", full_prefix, e);
                crate::metrics::record_cache_error(namespace);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn get_raw(&self, _key: &str) -> AppViewResult<Option<String>> {
            Err(AppViewError::Cache("connection refused".to_string()))
        }

        async fn set_raw(&self, _key: &str, _value: &str, _ttl: u64) -> AppViewResult<()> {
            Err(AppViewError::Cache("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> AppViewResult<()> {
            Err(AppViewError::Cache("connection refused".to_string()))
        }

        async fn delete_prefix(&self, _prefix: &str) -> AppViewResult<u64> {
            Err(AppViewError::Cache("connection refused".to_string()))
        }

        async fn ping(&self) -> AppViewResult<()> {
            Err(AppViewError::Cache("connection refused".to_string()))
        }
    }

    fn cache_over(backend: Arc<dyn CacheBackend>) -> ResultCache {
        ResultCache::new(backend, CacheConfig::default())
    }

    #[test]
    fn test_namespace_constants() {
        assert_eq!(namespaces::THREAD, "thread:");
        assert_eq!(namespaces::THREAD_CONTEXT, "threadctx:");
        assert_eq!(namespaces::REPLY_COUNT, "replycount:");
        assert_eq!(namespaces::GATE, "gate:");
    }

    #[test]
    fn test_key_part_escaping_prevents_collisions() {
        let uri = encode_key_part("at://did:plc:abc/app.bsky.feed.post/1");
        assert!(!uri.contains(':'));
        assert!(!uri.contains('/'));
        assert_ne!(
            format!("{}:{}", encode_key_part("a:b"), "c"),
            format!("{}:{}", encode_key_part("a"), "b:c")
        );
    }

    #[tokio::test]
    async fn test_memory_backend_round_trip_and_prefix_delete() {
        let backend = MemoryBackend::new();
        backend.set_raw("lens:thread:a:1", "1", 60).await.unwrap();
        backend.set_raw("lens:thread:a:2", "2", 60).await.unwrap();
        backend.set_raw("lens:thread:b:1", "3", 60).await.unwrap();

        assert_eq!(
            backend.get_raw("lens:thread:a:1").await.unwrap(),
            Some("1".to_string())
        );

        let deleted = backend.delete_prefix("lens:thread:a").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(backend.get_raw("lens:thread:a:1").await.unwrap(), None);
        assert!(backend.get_raw("lens:thread:b:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_miss() {
        let cache = cache_over(Arc::new(FailingBackend));

        let got: Option<String> = cache.get(namespaces::THREAD, "anything").await;
        assert_eq!(got, None);

        // Writes must not propagate the failure either
        cache
            .set(namespaces::THREAD, "anything", &"value".to_string(), 60)
            .await;
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let cache = ResultCache::disabled();
        cache
            .set(namespaces::THREAD, "k", &"value".to_string(), 60)
            .await;
        let got: Option<String> = cache.get(namespaces::THREAD, "k").await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_undeserializable_entry_is_dropped() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set_raw("lens:thread:bad", "{not json", 60)
            .await
            .unwrap();

        let cache = cache_over(backend.clone());
        let got: Option<Vec<String>> = cache.get(namespaces::THREAD, "bad").await;
        assert_eq!(got, None);
        assert_eq!(backend.get_raw("lens:thread:bad").await.unwrap(), None);
    }
}
