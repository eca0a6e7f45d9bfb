//! Shared, TTL-bounded key/value storage.
//!
//! Backends speak the five primitives the rest of the crate relies on
//! (`SET key value EX ttl`, `GET`, `EXISTS`, `DEL`, `KEYS pattern`) and report
//! failures as [`StoreError`]. [`CacheStore`] is the only caller of a backend:
//! it swallows every failure with a warning so that a store outage reads as
//! "nothing cached, nothing rate limited".

use crate::error::{Error, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Remaining lifetime in whole seconds, `None` when absent.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}

/// Redis-backed store sharing one multiplexed connection per process.
///
/// The connection is opened on first use and re-attempted on the next call if
/// that fails, so the service can start while Redis is down. Opening it is
/// bounded by `connect_timeout`.
pub struct RedisBackend {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    connect_timeout: Duration,
}

impl RedisBackend {
    pub fn new(redis_url: &str) -> Result<Self, Error> {
        let client = Client::open(redis_url)
            .map_err(|e| Error::Connection(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!("Opening Redis connection manager");
                let connect = ConnectionManager::new(self.client.clone());
                tokio::time::timeout(self.connect_timeout, connect)
                    .await
                    .map_err(|_| {
                        StoreError::Unavailable(format!(
                            "Redis connection not established within {:?}",
                            self.connect_timeout
                        ))
                    })?
                    .map_err(StoreError::from)
            })
            .await?;

        Ok(manager.clone())
    }
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let count: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let deleted: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(deleted)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        // -2: missing, -1: no expiry
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(ttl).ok())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {}", pong)))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    last_sweep: Instant,
}

impl MemoryState {
    /// Remove `key` if it has expired; the live entry otherwise.
    fn live(&mut self, key: &str, now: Instant) -> Option<&MemoryEntry> {
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn sweep(&mut self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        self.last_sweep = now;
        let purged = before - self.entries.len();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
    }
}

/// Expired entries are dropped whenever a lookup meets them, and writes sweep
/// the whole map at most once per this interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Single-process backend. Expiry is measured on the tokio clock.
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Entries currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let now = Instant::now();
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: now + Duration::from_secs(ttl_seconds.max(1)),
        };
        let mut state = self.state.write().await;
        if now.duration_since(state.last_sweep) >= SWEEP_INTERVAL {
            state.sweep(now);
        }
        state.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        {
            let state = self.state.read().await;
            match state.entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        let mut state = self.state.write().await;
        Ok(state.live(key, now).map(|entry| entry.value.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        Ok(state.live(key, now).is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        Ok(keys.iter().filter(|key| state.entries.remove(*key).is_some()).count() as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.sweep(now);
        Ok(state
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        Ok(state.live(key, now).map(|entry| {
            let remaining = entry.expires_at - now;
            // Round up like Redis does for a partially elapsed second
            remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Redis-style glob supporting `*` and `?`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, c));
            p += 1;
        } else if let Some((star_p, star_c)) = backtrack {
            p = star_p + 1;
            c = star_c + 1;
            backtrack = Some((star_p, star_c + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}

/// Best-effort facade over a [`CacheBackend`].
///
/// Cheap to clone; every clone shares the same backend.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Serialize and store `value`. Failures are logged and dropped.
    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_seconds: u64) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(cache_key = key, error = %e, "Failed to serialize cache value");
                return;
            }
        };

        if let Err(e) = self.backend.set_ex(key, &payload, ttl_seconds).await {
            warn!(cache_key = key, error = %e, "Cache write failed");
        }
    }

    /// Stored value if present, unexpired and decodable.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(cache_key = key, error = %e, "Cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(cache_key = key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.backend.exists(key).await.unwrap_or_else(|e| {
            warn!(cache_key = key, error = %e, "Cache exists check failed");
            false
        })
    }

    pub async fn ttl(&self, key: &str) -> Option<u64> {
        self.backend.ttl(key).await.unwrap_or_else(|e| {
            warn!(cache_key = key, error = %e, "Cache ttl lookup failed");
            None
        })
    }

    /// Delete every key matching `pattern`; returns how many went away.
    pub async fn delete(&self, pattern: &str) -> u64 {
        let keys = match self.backend.keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern, error = %e, "Cache key scan failed");
                return 0;
            }
        };

        match self.backend.del(&keys).await {
            Ok(deleted) => {
                debug!(pattern, deleted, "Invalidated cache keys");
                deleted
            }
            Err(e) => {
                warn!(pattern, error = %e, "Cache delete failed");
                0
            }
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    /// Backend that fails every operation, standing in for a Redis outage.
    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn set_ex(&self, _: &str, _: &str, _: u64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn del(&self, _: &[String]) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn keys(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn ttl(&self, _: &str) -> Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = CacheStore::in_memory();
        store.put("guild:1", &json!({"id": "1"}), 10).await;

        assert_eq!(store.ttl("guild:1").await, Some(10));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get::<Value>("guild:1").await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get::<Value>("guild:1").await.is_none());
        assert!(!store.exists("guild:1").await);
    }

    #[tokio::test]
    async fn test_undecodable_entry_reads_as_absent() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_ex("channels:1", "not json", 60).await.unwrap();
        let store = CacheStore::new(backend);

        assert!(store.get::<Value>("channels:1").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_by_pattern() {
        let store = CacheStore::in_memory();
        store.put("guild:1", &1, 60).await;
        store.put("channels:1", &2, 60).await;
        store.put("guild:2", &3, 60).await;

        assert_eq!(store.delete("guild:*").await, 2);
        assert!(store.get::<i32>("guild:1").await.is_none());
        assert_eq!(store.get::<i32>("channels:1").await, Some(2));
    }

    #[tokio::test]
    async fn test_outage_degrades_to_empty() {
        let store = CacheStore::new(Arc::new(DownBackend));
        store.put("guild:1", &1, 60).await;

        assert!(store.get::<i32>("guild:1").await.is_none());
        assert!(!store.exists("ratelimit:/users/@me").await);
        assert_eq!(store.delete("guild:*").await, 0);
        assert!(store.ping().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookups_purge_expired_entries() {
        let backend = MemoryBackend::new();
        for i in 0..1000 {
            backend.set_ex(&format!("guild:{}", i), "{}", 1).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(5)).await;

        for i in 0..500 {
            assert!(!backend.exists(&format!("guild:{}", i)).await.unwrap());
        }
        assert_eq!(backend.len().await, 500);

        assert!(backend.keys("*").await.unwrap().is_empty());
        assert!(backend.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_lookup_drops_expired_key() {
        let backend = MemoryBackend::new();
        backend.set_ex("ratelimit:/api/v10/users/@me", "1", 2).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(backend.ttl("ratelimit:/api/v10/users/@me").await.unwrap(), None);
        assert_eq!(backend.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_entries_periodically() {
        let backend = MemoryBackend::new();
        for i in 0..100 {
            backend.set_ex(&format!("me:{}", i), "{}", 1).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        backend.set_ex("guild:1", "{}", 600).await.unwrap();
        assert_eq!(backend.len().await, 101);

        tokio::time::advance(Duration::from_secs(31)).await;
        backend.set_ex("guild:2", "{}", 600).await.unwrap();
        assert_eq!(backend.len().await, 2);
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_within_connect_timeout() {
        // TEST-NET-1, never routed
        let backend = RedisBackend::new("redis://192.0.2.1:6379")
            .unwrap()
            .with_connect_timeout(Duration::from_millis(100));

        let outcome = tokio::time::timeout(Duration::from_secs(2), backend.ping()).await;

        assert!(matches!(outcome, Ok(Err(_))));
        assert!(CacheStore::new(Arc::new(backend)).get::<Value>("guild:1").await.is_none());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("guilds:42", "guilds:42"));
        assert!(glob_match("guilds:42:*", "guilds:42:stale"));
        assert!(!glob_match("guilds:42:*", "guilds:421"));
        assert!(glob_match("guild:?", "guild:7"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("guild:*", "channels:1"));
    }
}
