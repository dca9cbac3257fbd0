//! Key/Value Cache Facade.
//!
//! A single async interface with two interchangeable backends, chosen once
//! at startup: a cluster-wide Redis store, or an in-process
//! [`dashmap::DashMap`] for single-instance deployments. Every other
//! component (the Revoked-Token Store, the session manager) is written
//! against [`CacheFacade`] and never needs to know which backend is live.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "cache")]
use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};

use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// A value stored by the Local backend, with an expiry if one was ever set.
/// `None` means the entry persists until explicitly deleted or overwritten
/// with an explicit TTL, mirroring a Redis key written without `EX`.
struct LocalEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process backend: one [`DashMap`] guarded by nothing but its own
/// internal sharding. Entries are checked for expiry lazily on read; a
/// background sweep (see [`LocalCache::sweep_expired`]) reclaims memory for
/// keys nobody reads again.
#[derive(Clone, Default)]
struct LocalCache {
    entries: Arc<DashMap<String, LocalEntry>>,
}

impl LocalCache {
    /// Writes `key`, keeping whatever expiry it already had (or none, if it
    /// didn't exist). Use [`Self::setex`] to set an explicit TTL.
    fn set(&self, key: &str, value: &str) {
        let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    fn setex(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn is_live(entry: &LocalEntry) -> bool {
        match entry.expires_at {
            Some(exp) => exp > Instant::now(),
            None => true,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let expired = {
            let entry = self.entries.get(key)?;
            if Self::is_live(&entry) {
                return Some(entry.value.clone());
            }
            true
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn mget(&self, keys: &[&str]) -> Vec<Option<String>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries.get(key).and_then(|entry| {
            let exp = entry.expires_at?;
            let now = Instant::now();
            if exp > now {
                Some(exp - now)
            } else {
                None
            }
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| Self::is_live(&e) && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drops every expired entry. Intended to be called periodically by a
    /// background task; correctness never depends on it running (reads
    /// already treat expired entries as absent).
    fn sweep_expired(&self) -> usize {
        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !Self::is_live(&e))
            .map(|e| e.key().clone())
            .collect();
        for key in &dead {
            self.entries.remove(key);
        }
        dead.len()
    }
}

/// Redis-backed cluster cache.
#[cfg(feature = "cache")]
#[derive(Clone)]
struct ClusterCache {
    pool: Pool,
}

#[cfg(feature = "cache")]
impl ClusterCache {
    /// Writes `key`, preserving its existing TTL (`SET ... KEEPTTL`).
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("KEEPTTL")
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, secs).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        use redis::AsyncCommands;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let values: Vec<Option<String>> = conn.mget(keys).await?;
        Ok(values)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        use redis::AsyncCommands;
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        use redis::AsyncCommands;
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let secs: i64 = conn.ttl(key).await?;
        Ok(if secs >= 0 {
            Some(Duration::from_secs(secs as u64))
        } else {
            None
        })
    }

    /// Lists every key starting with `prefix` via cursor-based `SCAN`
    /// rather than a single blocking `KEYS pattern*` call, batching
    /// `SCAN_COUNT` keys per round-trip and deduplicating the result (Redis
    /// guarantees every live key is returned at least once per full scan,
    /// not exactly once).
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", prefix);
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let mut cursor: u64 = 0;
        let mut seen = std::collections::HashSet::new();

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            seen.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(seen.into_iter().collect())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Default batch size for `SCAN`'s `COUNT` hint, mirroring `scanStream`'s
/// default.
#[cfg(feature = "cache")]
const SCAN_COUNT: u32 = 100;

#[cfg(feature = "cache")]
fn pool_err(e: deadpool_redis::PoolError) -> Error {
    Error::Internal(format!("failed to get Redis connection: {}", e))
}

/// The facade used by every other component. Construction picks a backend
/// once; callers never branch on which one is live.
#[derive(Clone)]
pub enum CacheFacade {
    /// In-process backend, valid for single-instance deployments.
    Local(LocalCache),
    /// Cluster-wide backend shared by every server instance.
    #[cfg(feature = "cache")]
    Cluster(ClusterCache),
}

impl CacheFacade {
    /// Builds a Local-backend facade.
    pub fn local() -> Self {
        CacheFacade::Local(LocalCache::default())
    }

    /// Builds a Cluster-backend facade from Redis configuration, retrying
    /// the initial connection with exponential backoff.
    #[cfg(feature = "cache")]
    pub async fn cluster(config: &RedisConfig) -> Result<Self> {
        let pool = create_pool_with_retries(config, config.max_retries).await?;
        Ok(CacheFacade::Cluster(ClusterCache { pool }))
    }

    /// Writes `key`, preserving whatever expiry it already carried (or
    /// none, if it's new). Use [`Self::setex`] to also set a TTL.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        match self {
            CacheFacade::Local(c) => {
                c.set(key, value);
                Ok(())
            }
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(c) => c.set(key, value).await,
        }
    }

    /// Stores `value` under `key` with the given time-to-live, replacing
    /// any TTL the key previously had.
    pub async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        match self {
            CacheFacade::Local(c) => {
                c.setex(key, value, ttl);
                Ok(())
            }
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(c) => c.setex(key, value, ttl).await,
        }
    }

    /// Fetches the value stored under `key`, if any and unexpired.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            CacheFacade::Local(c) => Ok(c.get(key)),
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(c) => c.get(key).await,
        }
    }

    /// Fetches every value in `keys`, in order, `None` where absent or
    /// expired.
    pub async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        match self {
            CacheFacade::Local(c) => Ok(c.mget(keys)),
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(c) => c.mget(keys).await,
        }
    }

    /// Whether `key` currently holds an unexpired value.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            CacheFacade::Local(c) => Ok(c.exists(key)),
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(c) => c.exists(key).await,
        }
    }

    /// Removes `key` outright, regardless of its remaining TTL.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            CacheFacade::Local(c) => {
                c.delete(key);
                Ok(())
            }
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(c) => c.delete(key).await,
        }
    }

    /// The remaining time-to-live for `key`, or `None` if absent/expired.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        match self {
            CacheFacade::Local(c) => Ok(c.ttl(key)),
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(c) => c.ttl(key).await,
        }
    }

    /// Lists every unexpired key starting with `prefix`. Used sparingly
    /// (session/activity sweeps); `KEYS`-style scans are O(n) on Redis.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            CacheFacade::Local(c) => Ok(c.keys_with_prefix(prefix)),
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(c) => c.keys_with_prefix(prefix).await,
        }
    }

    /// Reclaims memory held by expired Local entries. A no-op on the
    /// Cluster backend, which expires keys natively.
    pub fn sweep_local_expired(&self) -> usize {
        match self {
            CacheFacade::Local(c) => c.sweep_expired(),
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(_) => 0,
        }
    }

    /// Checks backend reachability. Always `Ok` on the Local backend; on
    /// Cluster, round-trips a `PING` through the pool.
    pub async fn ping(&self) -> Result<()> {
        match self {
            CacheFacade::Local(_) => Ok(()),
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(c) => c.ping().await,
        }
    }

    /// Whether this facade is backed by the cluster store.
    pub fn is_cluster(&self) -> bool {
        match self {
            CacheFacade::Local(_) => false,
            #[cfg(feature = "cache")]
            CacheFacade::Cluster(_) => true,
        }
    }
}

/// Builds a Redis connection pool, retrying with exponential backoff.
#[cfg(feature = "cache")]
async fn create_pool_with_retries(config: &RedisConfig, max_retries: u32) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "cluster store connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        max_connections = config.max_connections,
                        "cluster store connection pool created"
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    tracing::error!(
                        "failed to connect to cluster store after {} attempts: {}",
                        max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay_multiplier = 2_u32.pow(attempt.saturating_sub(1));
                let delay = base_delay * delay_multiplier;
                tracing::warn!(
                    attempt,
                    ?delay,
                    "cluster store connection attempt failed: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(feature = "cache")]
async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let cfg = DeadpoolConfig::from_url(config.url());

    let pool = cfg
        .builder()
        .map_err(|e| Error::Internal(format!("failed to build cluster store pool: {}", e)))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Internal(format!("failed to create cluster store pool: {}", e)))?;

    let conn = pool.get().await.map_err(pool_err)?;
    drop(conn);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_set_get_roundtrip() {
        let cache = CacheFacade::local();
        cache
            .setex("k1", "v1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k1").await.unwrap(), Some("v1".to_string()));
        assert!(cache.exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn local_expiry_makes_key_absent() {
        let cache = CacheFacade::local();
        cache
            .setex("k2", "v2", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k2").await.unwrap(), None);
        assert!(!cache.exists("k2").await.unwrap());
    }

    #[tokio::test]
    async fn local_delete_removes_key() {
        let cache = CacheFacade::local();
        cache
            .setex("k3", "v3", Duration::from_secs(60))
            .await
            .unwrap();
        cache.delete("k3").await.unwrap();
        assert_eq!(cache.get("k3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn local_keys_with_prefix() {
        let cache = CacheFacade::local();
        cache
            .setex("SESSION_a", "1", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .setex("SESSION_b", "2", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .setex("OTHER_c", "3", Duration::from_secs(60))
            .await
            .unwrap();

        let mut keys = cache.keys_with_prefix("SESSION_").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["SESSION_a".to_string(), "SESSION_b".to_string()]);
    }

    #[tokio::test]
    async fn local_sweep_removes_only_expired() {
        let cache = CacheFacade::local();
        cache
            .setex("fresh", "1", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .setex("stale", "2", Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let removed = cache.sweep_local_expired();
        assert_eq!(removed, 1);
        assert!(cache.exists("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn local_set_preserves_existing_ttl() {
        let cache = CacheFacade::local();
        cache
            .setex("k4", "v4", Duration::from_secs(60))
            .await
            .unwrap();
        cache.set("k4", "v4-updated").await.unwrap();

        assert_eq!(cache.get("k4").await.unwrap(), Some("v4-updated".to_string()));
        assert!(cache.ttl("k4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn local_mget_returns_none_for_missing_keys() {
        let cache = CacheFacade::local();
        cache
            .setex("present", "1", Duration::from_secs(60))
            .await
            .unwrap();

        let values = cache.mget(&["present", "missing"]).await.unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None]);
    }

    #[test]
    fn local_facade_is_not_cluster() {
        assert!(!CacheFacade::local().is_cluster());
    }
}
