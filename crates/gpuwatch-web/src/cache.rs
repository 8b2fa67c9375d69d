//! Read-through response cache. Concurrent misses on one key share a single
//! origin load; followers wait for the leader up to a bounded time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gpuwatch_storage::CacheBackend;
use gpuwatch_sync::API_CACHE_PREFIX;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Cache key for a request, `api:` + sha256 of its path and query.
pub fn cache_key(path_and_query: &str) -> String {
    let digest = Sha256::digest(path_and_query.as_bytes());
    format!("{API_CACHE_PREFIX}{}", hex::encode(digest))
}

/// A rendered response body. Empty bodies are cached with the negative TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBody {
    pub body: String,
    pub empty: bool,
}

impl CachedBody {
    /// `null` and `[]` count as empty.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        let empty = match &value {
            JsonValue::Null => true,
            JsonValue::Array(items) => items.is_empty(),
            _ => false,
        };
        Ok(Self {
            body: value.to_string(),
            empty,
        })
    }

    pub fn text(body: String, empty: bool) -> Self {
        Self { body, empty }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Coalesced,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Coalesced => "coalesced",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cached {
    pub body: String,
    pub status: CacheStatus,
}

#[derive(Debug, Error)]
pub enum ReadThroughError {
    #[error("timed out after {0:?} waiting for an in-flight fetch")]
    WaitTimeout(Duration),
    #[error(transparent)]
    Origin(anyhow::Error),
}

type Shared = Option<Result<CachedBody, String>>;

enum Role {
    Leader(watch::Sender<Shared>),
    Follower(watch::Receiver<Shared>),
}

/// Removes the in-flight entry when the leader finishes or is cancelled.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<String, watch::Receiver<Shared>>>,
    key: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        inflight.remove(self.key);
    }
}

pub struct ReadThroughCache {
    backend: Arc<dyn CacheBackend>,
    inflight: Mutex<HashMap<String, watch::Receiver<Shared>>>,
    ttl: Duration,
    negative_ttl: Duration,
    wait: Duration,
}

impl ReadThroughCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        ttl: Duration,
        negative_ttl: Duration,
        wait: Duration,
    ) -> Self {
        Self {
            backend,
            inflight: Mutex::new(HashMap::new()),
            ttl,
            negative_ttl,
            wait,
        }
    }

    /// Serves `key` from the cache, or runs `load` once for all concurrent callers.
    pub async fn get_or_load<F, Fut>(&self, key: &str, load: F) -> Result<Cached, ReadThroughError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<CachedBody>>,
    {
        if let Some(body) = self.lookup(key).await {
            return Ok(Cached {
                body,
                status: CacheStatus::Hit,
            });
        }

        let role = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            match inflight.get(key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let _guard = InflightGuard {
                    inflight: &self.inflight,
                    key,
                };
                // A previous leader may have stored and left while our first
                // lookup was still in flight.
                if let Some(body) = self.lookup(key).await {
                    tx.send_replace(Some(Ok(CachedBody::text(body.clone(), false))));
                    return Ok(Cached {
                        body,
                        status: CacheStatus::Hit,
                    });
                }
                match load().await {
                    Ok(body) => {
                        self.store(key, &body).await;
                        tx.send_replace(Some(Ok(body.clone())));
                        Ok(Cached {
                            body: body.body,
                            status: CacheStatus::Miss,
                        })
                    }
                    Err(err) => {
                        tx.send_replace(Some(Err(format!("{err:#}"))));
                        Err(ReadThroughError::Origin(err))
                    }
                }
            }
            Role::Follower(rx) => match self.follow(rx).await? {
                Some(Ok(body)) => Ok(Cached {
                    body: body.body,
                    status: CacheStatus::Coalesced,
                }),
                Some(Err(message)) => Err(ReadThroughError::Origin(anyhow::anyhow!(message))),
                None => {
                    // Leader went away without a result; load without coalescing.
                    debug!(key, "in-flight leader abandoned, loading directly");
                    let body = load().await.map_err(ReadThroughError::Origin)?;
                    self.store(key, &body).await;
                    Ok(Cached {
                        body: body.body,
                        status: CacheStatus::Miss,
                    })
                }
            },
        }
    }

    /// Removes every cached API response. Best-effort.
    pub async fn invalidate_all(&self) -> u64 {
        match self.backend.delete_prefix(API_CACHE_PREFIX).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(error = %err, "cache invalidation failed");
                0
            }
        }
    }

    async fn follow(&self, mut rx: watch::Receiver<Shared>) -> Result<Shared, ReadThroughError> {
        let waited = tokio::time::timeout(self.wait, async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if current.is_some() {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;
        waited.map_err(|_| ReadThroughError::WaitTimeout(self.wait))
    }

    async fn lookup(&self, key: &str) -> Option<String> {
        match self.backend.get(key).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(key, error = %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn store(&self, key: &str, body: &CachedBody) {
        let ttl = if body.empty { self.negative_ttl } else { self.ttl };
        if let Err(err) = self.backend.set_ex(key, &body.body, ttl).await {
            warn!(key, error = %err, "cache write failed");
        }
    }
}
