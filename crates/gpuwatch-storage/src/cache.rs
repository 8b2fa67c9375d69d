//! Shared response cache backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::{timeout, Instant};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    /// Removes every key starting with `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// Bounded TTL cache held in process memory.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    max_entries: usize,
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Arc::default(),
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, e| e.expires_at > now);
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, e| e.expires_at > now);
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
            }
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

/// Redis-backed cache. Every command is bounded by `op_timeout`.
#[derive(Clone)]
pub struct RedisCache {
    client: redis::Client,
    op_timeout: Duration,
}

impl RedisCache {
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client, op_timeout })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        timeout(self.op_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CacheError::Timeout(self.op_timeout))?
            .map_err(CacheError::from)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = timeout(self.op_timeout, conn.get(key))
            .await
            .map_err(|_| CacheError::Timeout(self.op_timeout))??;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let seconds = ttl.as_secs().max(1);
        let _: () = timeout(self.op_timeout, conn.set_ex(key, value, seconds))
            .await
            .map_err(|_| CacheError::Timeout(self.op_timeout))??;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut deleted = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let removed: u64 = conn.del(&keys).await?;
                deleted += removed;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::default();
        cache
            .set_ex("api:a", "[1]", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("api:a").await.unwrap().as_deref(), Some("[1]"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("api:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_matching_keys() {
        let cache = MemoryCache::default();
        let ttl = Duration::from_secs(60);
        cache.set_ex("api:a", "1", ttl).await.unwrap();
        cache.set_ex("api:b", "2", ttl).await.unwrap();
        cache.set_ex("session:c", "3", ttl).await.unwrap();
        assert_eq!(cache.delete_prefix("api:").await.unwrap(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn full_cache_evicts_soonest_expiring_entry() {
        let cache = MemoryCache::new(2);
        cache.set_ex("a", "1", Duration::from_secs(5)).await.unwrap();
        cache.set_ex("b", "2", Duration::from_secs(50)).await.unwrap();
        cache.set_ex("c", "3", Duration::from_secs(50)).await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
    }
}
