//! Read-through cache with stampede protection.
//!
//! The client offers three read strategies over the same key namespace
//! (`cache:<entity>:<id>`), all sharing one penetration guard:
//!
//! - [`CacheClient::get_or_load`] — plain read-through. A confirmed-absent
//!   key is remembered with an empty sentinel under a short TTL, so
//!   repeated lookups of non-existent ids never reach the source of truth.
//! - [`CacheClient::get_with_mutex`] — for keys whose rebuild is expensive
//!   enough that a stampede must be serialized. On a miss, callers race
//!   for the per-key rebuild lock; losers sleep and retry a bounded number
//!   of times instead of recursing unboundedly.
//! - [`CacheClient::get_with_logical_expire`] — for pre-seeded hot keys.
//!   Entries never physically expire; each embeds its own expiry
//!   timestamp. A stale entry is served immediately while the single
//!   reader that wins the rebuild lock refreshes it on the background
//!   [`RebuildPool`]. No caller ever blocks on a rebuild.
//!
//! Writes are invalidate-only: the source-of-truth mutation path calls
//! [`CacheClient::invalidate`] and the next read repopulates lazily.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use voucherflow_redis::cache::{CacheClient, CacheError};
//!
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Shop { name: String }
//! # async fn load_shop() -> Result<Option<Shop>, CacheError> { Ok(None) }
//! # async fn example(conn: redis::aio::ConnectionManager) -> Result<(), Box<dyn std::error::Error>> {
//! let cache = CacheClient::builder(conn).build();
//!
//! let shop: Option<Shop> = cache
//!     .get_or_load("shop", "7", Duration::from_secs(1800), || load_shop())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::keys::{NULL_CACHE_TTL, REBUILD_LOCK_TTL, cache_key, rebuild_lock_name};
use crate::lock::{LockError, RedisLock};
use crate::rebuild::RebuildPool;
use chrono::Utc;
use rand::Rng;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

/// Default cap on mutex-strategy lock retries.
const DEFAULT_MUTEX_RETRIES: u32 = 10;

/// Default sleep between mutex-strategy lock retries.
const DEFAULT_MUTEX_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Default rebuild pool capacity.
const DEFAULT_REBUILD_CAPACITY: u32 = 10;

/// Errors raised by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache store could not be reached.
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    /// A cached payload could not be decoded.
    #[error("cached payload could not be decoded: {0}")]
    Decode(String),

    /// A value could not be encoded for caching.
    #[error("value could not be encoded: {0}")]
    Encode(String),

    /// The source-of-truth loader failed.
    #[error("source-of-truth load failed: {0}")]
    Upstream(String),

    /// The mutex strategy spent its whole retry budget without the rebuild
    /// lock becoming free. A contention outcome: callers may retry later.
    #[error("rebuild lock still contended after {attempts} attempts")]
    RebuildContended {
        /// How many acquisition attempts were made.
        attempts: u32,
    },
}

impl From<LockError> for CacheError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Unavailable(reason) => Self::Unavailable(reason),
        }
    }
}

/// A cached value wrapped with its application-level expiry timestamp.
///
/// Stored as JSON with no store-level TTL; the entry only ever expires
/// logically.
#[derive(serde::Serialize, serde::Deserialize)]
struct Envelope<T> {
    data: T,
    expires_at: i64,
}

/// Result of one cache lookup, before any loader involvement.
enum Lookup<T> {
    /// A live entry.
    Hit(T),
    /// The empty sentinel: absence was previously confirmed.
    Sentinel,
    /// No entry at all.
    Miss,
}

/// Read-through cache client.
///
/// Cheap to clone; clones share the connection manager and the rebuild
/// pool.
#[derive(Clone)]
pub struct CacheClient {
    conn: ConnectionManager,
    null_ttl: Duration,
    rebuild_lock_ttl: Duration,
    mutex_retries: u32,
    mutex_retry_delay: Duration,
    pool: RebuildPool,
}

impl CacheClient {
    /// Start building a client over `conn`.
    #[must_use]
    pub fn builder(conn: ConnectionManager) -> CacheClientBuilder {
        CacheClientBuilder {
            conn,
            null_ttl: None,
            rebuild_lock_ttl: None,
            mutex_retries: None,
            mutex_retry_delay: None,
            rebuild_capacity: None,
        }
    }

    /// The pool running background rebuilds for this client.
    #[must_use]
    pub const fn rebuild_pool(&self) -> &RebuildPool {
        &self.pool
    }

    /// Write `value` under `cache:{entity}:{id}` with a store-level TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Encode`] or [`CacheError::Unavailable`].
    pub async fn set<T: Serialize>(
        &self,
        entity: &str,
        id: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = cache_key(entity, id);
        self.write_value(&key, value, ttl).await
    }

    /// Write `value` wrapped with a logical expiry of `now + ttl`, with no
    /// store-level TTL. Used to pre-seed hot keys for
    /// [`get_with_logical_expire`](Self::get_with_logical_expire).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Encode`] or [`CacheError::Unavailable`].
    pub async fn set_with_logical_expiry<T: Serialize>(
        &self,
        entity: &str,
        id: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = cache_key(entity, id);
        self.write_envelope(&key, value, ttl).await
    }

    /// Delete the entry for `cache:{entity}:{id}`.
    ///
    /// Called synchronously by source-of-truth mutation paths
    /// (write-invalidate); the next read repopulates lazily.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`].
    pub async fn invalidate(&self, entity: &str, id: &str) -> Result<(), CacheError> {
        let key = cache_key(entity, id);
        let mut conn = self.conn.clone();

        let _: () = conn
            .del(&key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        tracing::debug!(%key, "cache entry invalidated");
        Ok(())
    }

    /// Plain read-through with penetration protection.
    ///
    /// Cache hit → deserialize and return. Sentinel hit → `Ok(None)`
    /// without touching the loader. Miss → invoke `loader`; a `None`
    /// result writes the empty sentinel under the short null TTL, a value
    /// is cached under `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on store, codec or loader failure.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        entity: &str,
        id: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, CacheError>>,
    {
        let key = cache_key(entity, id);

        match self.lookup(&key).await? {
            Lookup::Hit(value) => {
                metrics::counter!("cache.hits").increment(1);
                return Ok(Some(value));
            }
            Lookup::Sentinel => {
                metrics::counter!("cache.sentinel_hits").increment(1);
                tracing::debug!(%key, "null-cache sentinel hit");
                return Ok(None);
            }
            Lookup::Miss => {}
        }

        metrics::counter!("cache.misses").increment(1);
        self.load_and_fill(&key, ttl, loader).await
    }

    /// Read-through with mutex-serialized rebuilds (breakdown protection).
    ///
    /// On a miss, callers race for the per-key rebuild lock. The winner
    /// double-checks the cache, rebuilds it from the loader and releases
    /// the lock; losers sleep briefly and retry, up to a bounded number of
    /// attempts.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::RebuildContended`] once the retry budget is
    /// spent, or any store/codec/loader failure.
    pub async fn get_with_mutex<T, F, Fut>(
        &self,
        entity: &str,
        id: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, CacheError>>,
    {
        let key = cache_key(entity, id);
        let mut attempts = 0_u32;

        let lock = loop {
            match self.lookup(&key).await? {
                Lookup::Hit(value) => {
                    metrics::counter!("cache.hits").increment(1);
                    return Ok(Some(value));
                }
                Lookup::Sentinel => {
                    metrics::counter!("cache.sentinel_hits").increment(1);
                    return Ok(None);
                }
                Lookup::Miss => {}
            }

            let lock = RedisLock::new(
                self.conn.clone(),
                &rebuild_lock_name(entity, id),
                self.rebuild_lock_ttl,
            );

            attempts += 1;
            if lock.try_lock().await? {
                break lock;
            }

            if attempts > self.mutex_retries {
                tracing::warn!(%key, attempts, "giving up on contended rebuild lock");
                return Err(CacheError::RebuildContended { attempts });
            }

            tokio::time::sleep(self.jittered_retry_delay()).await;
        };

        metrics::counter!("cache.misses").increment(1);

        // Double-check after winning the lock: the previous holder may
        // have already rebuilt the entry.
        let result = match self.lookup(&key).await {
            Ok(Lookup::Hit(value)) => Ok(Some(value)),
            Ok(Lookup::Sentinel) => Ok(None),
            Ok(Lookup::Miss) => self.load_and_fill(&key, ttl, loader).await,
            Err(err) => Err(err),
        };

        if let Err(error) = lock.unlock().await {
            tracing::warn!(%key, %error, "rebuild lock release failed; TTL will reclaim it");
        }

        result
    }

    /// Read a pre-seeded hot key with logical expiry (breakdown
    /// protection without blocking).
    ///
    /// A miss means the key was never seeded and yields `Ok(None)`. A
    /// fresh entry is returned directly. A stale entry is returned
    /// immediately as well — and if this reader wins the per-key rebuild
    /// lock, a refresh task is submitted to the background pool; if not,
    /// another reader is already rebuilding and no extra work is
    /// scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on store or codec failure. Loader failures
    /// inside the background refresh are logged, not surfaced: the caller
    /// already has the stale value.
    pub async fn get_with_logical_expire<T, F, Fut>(
        &self,
        entity: &str,
        id: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, CacheError>> + Send + 'static,
    {
        let key = cache_key(entity, id);
        let mut conn = self.conn.clone();

        let raw: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        // Hot keys are seeded by an administrative step; a true miss means
        // the key was never published, not a race.
        let Some(raw) = raw else {
            metrics::counter!("cache.misses").increment(1);
            return Ok(None);
        };

        let envelope: Envelope<T> =
            serde_json::from_str(&raw).map_err(|e| CacheError::Decode(e.to_string()))?;

        if envelope.expires_at > Utc::now().timestamp() {
            metrics::counter!("cache.hits").increment(1);
            return Ok(Some(envelope.data));
        }

        metrics::counter!("cache.stale_served").increment(1);

        let lock = RedisLock::new(
            self.conn.clone(),
            &rebuild_lock_name(entity, id),
            self.rebuild_lock_ttl,
        );

        if lock.try_lock().await? {
            let client = self.clone();
            let task_key = key.clone();

            self.pool.submit(async move {
                client.refresh_envelope(&task_key, ttl, loader).await;

                if let Err(error) = lock.unlock().await {
                    tracing::warn!(key = %task_key, %error, "rebuild lock release failed");
                }
            });
        }

        Ok(Some(envelope.data))
    }

    /// Background refresh body for a logically expired entry.
    async fn refresh_envelope<T, F, Fut>(&self, key: &str, ttl: Duration, loader: F)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, CacheError>> + Send,
    {
        // Another worker may have refreshed the entry between this
        // reader's lookup and its lock acquisition.
        let mut conn = self.conn.clone();
        let current: Result<Option<String>, _> = conn.get(key).await;
        if let Ok(Some(raw)) = current {
            if let Ok(envelope) = serde_json::from_str::<Envelope<serde_json::Value>>(&raw) {
                if envelope.expires_at > Utc::now().timestamp() {
                    tracing::debug!(key, "entry already refreshed, skipping rebuild");
                    return;
                }
            }
        }

        metrics::counter!("cache.rebuilds").increment(1);

        let outcome = match loader().await {
            Ok(Some(value)) => self.write_envelope(key, &value, ttl).await,
            Ok(None) => {
                // Seeded keys are removed through invalidate, not by the
                // loader; keep serving the stale entry and flag it.
                tracing::warn!(key, "rebuild loader found no source row; entry left stale");
                Ok(())
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => tracing::debug!(key, "hot entry rebuilt"),
            Err(error) => tracing::error!(key, %error, "cache rebuild failed"),
        }
    }

    /// Invoke the loader on a confirmed miss and fill the entry.
    async fn load_and_fill<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, CacheError>>,
    {
        match loader().await? {
            Some(value) => {
                self.write_value(key, &value, ttl).await?;
                Ok(Some(value))
            }
            None => {
                self.write_sentinel(key).await?;
                Ok(None)
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>, CacheError> {
        let mut conn = self.conn.clone();

        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        match raw {
            None => Ok(Lookup::Miss),
            Some(raw) if raw.is_empty() => Ok(Lookup::Sentinel),
            Some(raw) => serde_json::from_str(&raw)
                .map(Lookup::Hit)
                .map_err(|e| CacheError::Decode(e.to_string())),
        }
    }

    async fn write_value<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let json = serde_json::to_string(value).map_err(|e| CacheError::Encode(e.to_string()))?;
        let mut conn = self.conn.clone();

        let _: () = conn
            .set_ex(key, json, ttl.as_secs().max(1))
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        Ok(())
    }

    async fn write_sentinel(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .set_ex(key, "", self.null_ttl.as_secs().max(1))
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        tracing::debug!(key, "absence cached as null sentinel");
        Ok(())
    }

    async fn write_envelope<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let envelope = Envelope {
            data: value,
            expires_at: Utc::now().timestamp() + ttl_seconds,
        };

        let json =
            serde_json::to_string(&envelope).map_err(|e| CacheError::Encode(e.to_string()))?;
        let mut conn = self.conn.clone();

        // No store-level TTL: the entry only expires logically.
        let _: () = conn
            .set(key, json)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        Ok(())
    }

    fn jittered_retry_delay(&self) -> Duration {
        let base = self.mutex_retry_delay.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base.max(2) / 2);
        Duration::from_millis(base + jitter)
    }
}

/// Builder for [`CacheClient`].
pub struct CacheClientBuilder {
    conn: ConnectionManager,
    null_ttl: Option<Duration>,
    rebuild_lock_ttl: Option<Duration>,
    mutex_retries: Option<u32>,
    mutex_retry_delay: Option<Duration>,
    rebuild_capacity: Option<u32>,
}

impl CacheClientBuilder {
    /// TTL for empty sentinels (default: [`crate::keys::NULL_CACHE_TTL`]).
    #[must_use]
    pub const fn null_ttl(mut self, ttl: Duration) -> Self {
        self.null_ttl = Some(ttl);
        self
    }

    /// TTL for per-key rebuild locks (default:
    /// [`crate::keys::REBUILD_LOCK_TTL`]).
    #[must_use]
    pub const fn rebuild_lock_ttl(mut self, ttl: Duration) -> Self {
        self.rebuild_lock_ttl = Some(ttl);
        self
    }

    /// Cap on mutex-strategy lock retries (default: 10).
    #[must_use]
    pub const fn mutex_retries(mut self, retries: u32) -> Self {
        self.mutex_retries = Some(retries);
        self
    }

    /// Sleep between mutex-strategy retries (default: 50ms, jittered).
    #[must_use]
    pub const fn mutex_retry_delay(mut self, delay: Duration) -> Self {
        self.mutex_retry_delay = Some(delay);
        self
    }

    /// Concurrent background rebuild cap (default: 10).
    #[must_use]
    pub const fn rebuild_capacity(mut self, capacity: u32) -> Self {
        self.rebuild_capacity = Some(capacity);
        self
    }

    /// Build the client.
    ///
    /// # Panics
    ///
    /// Panics if `rebuild_capacity` was set to 0.
    #[must_use]
    pub fn build(self) -> CacheClient {
        CacheClient {
            conn: self.conn,
            null_ttl: self.null_ttl.unwrap_or(NULL_CACHE_TTL),
            rebuild_lock_ttl: self.rebuild_lock_ttl.unwrap_or(REBUILD_LOCK_TTL),
            mutex_retries: self.mutex_retries.unwrap_or(DEFAULT_MUTEX_RETRIES),
            mutex_retry_delay: self.mutex_retry_delay.unwrap_or(DEFAULT_MUTEX_RETRY_DELAY),
            pool: RebuildPool::new(self.rebuild_capacity.unwrap_or(DEFAULT_REBUILD_CAPACITY)),
        }
    }
}
