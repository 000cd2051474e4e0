//! Redis-backed stores for limit counters, spend buckets, cached responses,
//! and the advisory authentication cache.
//!
//! Admission correctness depends on increment-then-compare being a single
//! round-trip: the increment and its expiry run as one atomic pipeline so
//! two concurrent requests cannot both observe a pre-limit value.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store operation timed out")]
    Timeout,
}

/// Atomic counters with TTL, keyed by `(scope, window bucket)` strings.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment by one and (re)arm the expiry, returning the
    /// post-increment value. One atomic round-trip.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Increment by `delta` and (re)arm the expiry, returning the
    /// post-increment value.
    async fn increment_by(&self, key: &str, delta: i64, ttl: Duration)
        -> Result<i64, StoreError>;

    /// Current value; missing keys read as zero.
    async fn get(&self, key: &str) -> Result<i64, StoreError>;
}

/// Byte blobs with TTL. Both operations are best-effort from the caller's
/// perspective; errors surface so the caller can decide to ignore them.
#[async_trait]
pub trait ByteCache: Send + Sync {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn store_bytes(&self, key: &str, value: &[u8], ttl: Duration)
        -> Result<(), StoreError>;
}

/// Counter store backed by one logical Redis database.
#[derive(Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(client: redis::Client, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
            write_timeout,
        }
    }

    /// Verify connectivity at startup.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        timeout(self.read_timeout, async {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.increment_by(key, 1, ttl).await
    }

    async fn increment_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let (value,): (i64,) = timeout(self.write_timeout, async {
            redis::pipe()
                .atomic()
                .incr(key, delta)
                .expire(key, ttl_secs)
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<i64> = timeout(self.read_timeout, async {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(value.unwrap_or(0))
    }
}

/// Byte cache backed by one logical Redis database.
#[derive(Clone)]
pub struct RedisByteCache {
    client: redis::Client,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RedisByteCache {
    pub fn new(client: redis::Client, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
            write_timeout,
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        timeout(self.read_timeout, async {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }
}

#[async_trait]
impl ByteCache for RedisByteCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<Vec<u8>> = timeout(self.read_timeout, async {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(value)
    }

    async fn store_bytes(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        timeout(self.write_timeout, async {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async::<()>(&mut conn)
                .await
        })
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }
}

/// Advisory cache mapping `(key_id, path)` to an allow verdict. A miss or a
/// backend error simply re-runs full authentication.
pub struct AccessCache {
    cache: Box<dyn ByteCache>,
    ttl: Duration,
}

impl AccessCache {
    pub fn new(cache: Box<dyn ByteCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn cache_key(key_id: &str, path: &str) -> String {
        format!("access:{}:{}", key_id, path)
    }

    pub async fn is_allowed(&self, key_id: &str, path: &str) -> bool {
        matches!(
            self.cache.get_bytes(&Self::cache_key(key_id, path)).await,
            Ok(Some(_))
        )
    }

    pub async fn set_allowed(&self, key_id: &str, path: &str) {
        let _ = self
            .cache
            .store_bytes(&Self::cache_key(key_id, path), b"1", self.ttl)
            .await;
    }
}

/// In-memory counter store. Backs tests and single-node dev setups where no
/// Redis is available.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, (i64, Option<Instant>)>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> i64 {
        match self.entries.get(key) {
            Some(entry) => match entry.1 {
                Some(expiry) if Instant::now() >= expiry => 0,
                _ => entry.0,
            },
            None => 0,
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.increment_by(key, 1, ttl).await
    }

    async fn increment_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert((0, None));
        if matches!(entry.1, Some(expiry) if now >= expiry) {
            entry.0 = 0;
        }
        entry.0 += delta;
        entry.1 = Some(now + ttl);
        Ok(entry.0)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.live_value(key))
    }
}

/// In-memory byte cache with TTL expiry on read.
#[derive(Default)]
pub struct MemoryByteCache {
    entries: DashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl MemoryByteCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ByteCache for MemoryByteCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.entries.get(key) {
            Some(entry) => match entry.1 {
                Some(expiry) if Instant::now() >= expiry => {
                    drop(entry);
                    self.entries.remove(key);
                    Ok(None)
                }
                _ => Ok(Some(entry.0.clone())),
            },
            None => Ok(None),
        }
    }

    async fn store_bytes(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), (value.to_vec(), Some(Instant::now() + ttl)));
        Ok(())
    }
}
