//! Two-tier discovery cache keyed by request fingerprint.
//!
//! The local tier is an in-process LRU with TTL, keyed by fingerprint and
//! specialized to hold a serialized discovery response. The remote tier is
//! an optional
//! pluggable key/value backend; failures there are logged and degrade to
//! local-only rather than aborting the request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
    last_accessed: Instant,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self { value, expires_at: ttl.map(|d| now + d), last_accessed: now }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub insertions: u64,
}

/// In-process LRU cache with TTL, keyed by fingerprint hex string.
struct LocalCache {
    storage: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
    default_ttl: Option<Duration>,
    stats: RwLock<CacheStats>,
}

impl LocalCache {
    fn new(max_entries: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            storage: RwLock::new(HashMap::new()),
            max_entries,
            default_ttl,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut storage = self.storage.write().await;
        let mut stats = self.stats.write().await;

        if let Some(entry) = storage.get_mut(key) {
            if entry.is_expired() {
                storage.remove(key);
                stats.expirations += 1;
                stats.misses += 1;
                return None;
            }
            entry.last_accessed = Instant::now();
            stats.hits += 1;
            Some(entry.value.clone())
        } else {
            stats.misses += 1;
            None
        }
    }

    async fn put(&self, key: String, value: String) {
        let mut storage = self.storage.write().await;
        let mut stats = self.stats.write().await;

        let expired: Vec<String> =
            storage.iter().filter(|(_, e)| e.is_expired()).map(|(k, _)| k.clone()).collect();
        for k in expired {
            storage.remove(&k);
            stats.expirations += 1;
        }

        if storage.len() >= self.max_entries && !storage.contains_key(&key) {
            if let Some((lru_key, _)) = storage.iter().min_by_key(|(_, e)| e.last_accessed).map(|(k, v)| (k.clone(), v.last_accessed)) {
                storage.remove(&lru_key);
                stats.evictions += 1;
            }
        }

        storage.insert(key, CacheEntry::new(value, self.default_ttl));
        stats.insertions += 1;
    }

    async fn stats(&self) -> CacheStats {
        *self.stats.read().await
    }
}

/// A pluggable remote key/value backend for the shared cache tier.
#[async_trait]
pub trait RemoteCacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, value: &str, ttl: Duration);
}

/// Two-layer discovery cache: local LRU always present, remote tier
/// optional.
pub struct DiscoveryCache {
    local: LocalCache,
    remote: Option<Arc<dyn RemoteCacheBackend>>,
    remote_ttl: Duration,
}

impl DiscoveryCache {
    pub fn new(max_local_entries: usize, ttl: Duration) -> Self {
        Self { local: LocalCache::new(max_local_entries, Some(ttl)), remote: None, remote_ttl: ttl }
    }

    pub fn with_remote(mut self, backend: Arc<dyn RemoteCacheBackend>) -> Self {
        self.remote = Some(backend);
        self
    }

    /// Look up a fingerprint, consulting the local tier then falling back
    /// to the remote tier on miss.
    pub async fn get(&self, fingerprint: &str) -> Option<String> {
        if let Some(value) = self.local.get(fingerprint).await {
            return Some(value);
        }

        if let Some(remote) = &self.remote {
            if let Some(value) = remote.get(fingerprint).await {
                self.local.put(fingerprint.to_string(), value.clone()).await;
                return Some(value);
            }
        }

        None
    }

    /// Insert a serialized response. The remote write is best-effort: any
    /// failure is swallowed here since `RemoteCacheBackend` itself has no
    /// error channel — backends that can fail should log internally and
    /// simply decline to store.
    pub async fn put(&self, fingerprint: &str, value: String) {
        self.local.put(fingerprint.to_string(), value.clone()).await;
        if let Some(remote) = &self.remote {
            remote.put(fingerprint, &value, self.remote_ttl).await;
        }
    }

    pub async fn stats(&self) -> CacheStats {
        self.local.stats().await
    }
}

/// An in-memory stand-in for a remote cache backend, useful for tests and
/// for deployments without a shared store.
pub struct InMemoryRemoteCache {
    storage: RwLock<HashMap<String, (String, Instant)>>,
}

impl Default for InMemoryRemoteCache {
    fn default() -> Self {
        Self { storage: RwLock::new(HashMap::new()) }
    }
}

#[async_trait]
impl RemoteCacheBackend for InMemoryRemoteCache {
    async fn get(&self, key: &str) -> Option<String> {
        let storage = self.storage.read().await;
        storage.get(key).filter(|(_, expires_at)| Instant::now() <= *expires_at).map(|(v, _)| v.clone())
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) {
        self.storage.write().await.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }
}

/// A remote backend that always fails, used to verify that remote errors
/// degrade to local-only rather than aborting the request.
pub struct AlwaysFailingRemoteCache;

#[async_trait]
impl RemoteCacheBackend for AlwaysFailingRemoteCache {
    async fn get(&self, _key: &str) -> Option<String> {
        warn!("remote cache get failed, degrading to local-only");
        None
    }

    async fn put(&self, _key: &str, _value: &str, _ttl: Duration) {
        warn!("remote cache put failed, response still served from local tier");
    }
}

/// Redis-backed remote tier, wired up from `discovery_cache.remote` when
/// `kind = "redis"`. Requires the `cache-redis` feature.
#[cfg(feature = "cache-redis")]
pub struct RedisRemoteCache {
    conn: tokio::sync::Mutex<redis::aio::ConnectionManager>,
    key_prefix: String,
}

#[cfg(feature = "cache-redis")]
impl RedisRemoteCache {
    pub async fn connect(
        host: &str,
        port: u16,
        password: Option<&str>,
        key_prefix: impl Into<String>,
    ) -> Result<Self, redis::RedisError> {
        let auth = password.map(|p| format!(":{p}@")).unwrap_or_default();
        let url = format!("redis://{auth}{host}:{port}");
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn: tokio::sync::Mutex::new(conn), key_prefix: key_prefix.into() })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{key}", self.key_prefix)
    }
}

#[cfg(feature = "cache-redis")]
#[async_trait]
impl RemoteCacheBackend for RedisRemoteCache {
    async fn get(&self, key: &str) -> Option<String> {
        use redis::AsyncCommands;
        let mut conn = self.conn.lock().await;
        conn.get(self.namespaced(key)).await.ok()
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) {
        use redis::AsyncCommands;
        let mut conn = self.conn.lock().await;
        let _: Result<(), _> = conn.set_ex(self.namespaced(key), value, ttl.as_secs().max(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hit_returns_previously_written_value() {
        let cache = DiscoveryCache::new(10, Duration::from_secs(60));
        cache.put("fp1", "body1".to_string()).await;
        assert_eq!(cache.get("fp1").await, Some("body1".to_string()));
    }

    #[tokio::test]
    async fn ttl_expiry_evicts_entry() {
        let cache = DiscoveryCache::new(10, Duration::from_millis(20));
        cache.put("fp1", "body1".to_string()).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("fp1").await, None);
    }

    #[tokio::test]
    async fn lru_eviction_respects_capacity() {
        let cache = DiscoveryCache::new(2, Duration::from_secs(60));
        cache.put("a".to_string(), "1".to_string()).await;
        cache.put("b".to_string(), "2".to_string()).await;
        cache.get("a").await; // touch a so b is the LRU entry
        cache.put("c".to_string(), "3".to_string()).await;
        assert_eq!(cache.get("a").await, Some("1".to_string()));
        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("c").await, Some("3".to_string()));
    }

    #[tokio::test]
    async fn remote_failure_degrades_to_local_only() {
        let cache = DiscoveryCache::new(10, Duration::from_secs(60)).with_remote(Arc::new(AlwaysFailingRemoteCache));
        cache.put("fp1", "body1".to_string()).await;
        assert_eq!(cache.get("fp1").await, Some("body1".to_string()));
    }

    #[tokio::test]
    async fn remote_hit_populates_local_tier() {
        let remote = Arc::new(InMemoryRemoteCache::default());
        remote.put("fp1", "remote-body", Duration::from_secs(60)).await;
        let cache = DiscoveryCache::new(10, Duration::from_secs(60)).with_remote(remote);
        assert_eq!(cache.get("fp1").await, Some("remote-body".to_string()));
    }
}
