//! The OTLP filter's classification cache: a small trait with an
//! always-available in-process TTL map and an optional Redis-backed
//! implementation for multi-replica deployments, mirroring the external
//! cache plugged into this kind of system elsewhere in the ecosystem.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::classify::SeriesState;

/// Batch get/set of classification states, tolerant of partial results:
/// a miss or an error for one key must never fail the whole batch.
#[async_trait]
pub trait StateCache: Send + Sync {
    /// Returns whatever subset of `keys` is currently cached.
    async fn get_states(&self, keys: &[String]) -> HashMap<String, SeriesState>;

    /// Caches `states`. `Unknown` entries are never written (§4.5).
    async fn set_states(&self, states: &HashMap<String, SeriesState>, ttl: Duration);
}

struct Entry {
    state: SeriesState,
    expires_at: Instant,
}

/// Default, always-available cache: a `parking_lot::Mutex`-guarded map with
/// per-entry expiry checked on read.
pub struct MemoryCache {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateCache for MemoryCache {
    async fn get_states(&self, keys: &[String]) -> HashMap<String, SeriesState> {
        let now = Instant::now();
        let map = self.inner.lock();
        keys.iter()
            .filter_map(|key| {
                map.get(key).filter(|entry| entry.expires_at > now).map(|entry| (key.clone(), entry.state))
            })
            .collect()
    }

    async fn set_states(&self, states: &HashMap<String, SeriesState>, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut map = self.inner.lock();
        for (key, state) in states {
            if matches!(state, SeriesState::Unknown) {
                continue;
            }
            map.insert(key.clone(), Entry { state: *state, expires_at });
        }
    }
}

/// Redis-backed cache for deployments running more than one filter replica.
/// States are stored as a single byte (`u`/`n`) under `otlp:state:<key>`
/// with `SETEX`; lookup errors degrade to an empty result (fail-open).
#[cfg(feature = "redis-cache")]
pub struct RedisCache {
    client: redis::Client,
}

#[cfg(feature = "redis-cache")]
impl RedisCache {
    pub fn new(url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self { client: redis::Client::open(url)? })
    }

    fn key(name: &str) -> String {
        format!("otlp:state:{name}")
    }
}

#[cfg(feature = "redis-cache")]
#[async_trait]
impl StateCache for RedisCache {
    async fn get_states(&self, keys: &[String]) -> HashMap<String, SeriesState> {
        use redis::AsyncCommands;

        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            return HashMap::new();
        };
        let redis_keys: Vec<String> = keys.iter().map(|k| Self::key(k)).collect();
        let Ok(values) = conn.mget::<_, Vec<Option<String>>>(&redis_keys).await else {
            return HashMap::new();
        };
        keys.iter()
            .zip(values)
            .filter_map(|(key, value)| {
                let state = match value.as_deref() {
                    Some("u") => SeriesState::Used,
                    Some("n") => SeriesState::Unused,
                    _ => return None,
                };
                Some((key.clone(), state))
            })
            .collect()
    }

    async fn set_states(&self, states: &HashMap<String, SeriesState>, ttl: Duration) {
        use redis::AsyncCommands;

        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            return;
        };
        for (key, state) in states {
            let value = match state {
                SeriesState::Used => "u",
                SeriesState::Unused => "n",
                SeriesState::Unknown => continue,
            };
            let _: Result<(), _> = conn.set_ex(Self::key(key), value, ttl.as_secs().max(1)).await;
        }
    }
}

/// Builds the configured cache implementation. Redis is only reachable when
/// this binary was built with the `redis-cache` feature; otherwise
/// `redis.enabled` is honoured by falling back to the in-memory cache.
pub fn build(config: &crate::config::RedisConfig) -> Arc<dyn StateCache> {
    #[cfg(feature = "redis-cache")]
    if config.enabled {
        match RedisCache::new(&config.url) {
            Ok(cache) => return Arc::new(cache),
            Err(err) => {
                tracing::warn!(%err, "failed to construct redis cache, falling back to in-memory");
            }
        }
    }
    #[cfg(not(feature = "redis-cache"))]
    if config.enabled {
        tracing::warn!("redis.enabled is set but this binary was built without the redis-cache feature; using in-memory cache");
    }
    Arc::new(MemoryCache::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_round_trips_used_and_unused() {
        let cache = MemoryCache::new();
        let mut states = HashMap::new();
        states.insert("up".to_owned(), SeriesState::Used);
        states.insert("down".to_owned(), SeriesState::Unused);
        states.insert("ghost".to_owned(), SeriesState::Unknown);
        cache.set_states(&states, Duration::from_secs(60)).await;

        let got = cache.get_states(&["up".to_owned(), "down".to_owned(), "ghost".to_owned()]).await;
        assert_eq!(got.get("up"), Some(&SeriesState::Used));
        assert_eq!(got.get("down"), Some(&SeriesState::Unused));
        assert_eq!(got.get("ghost"), None, "Unknown states are never cached");
    }

    #[tokio::test]
    async fn memory_cache_entries_expire() {
        let cache = MemoryCache::new();
        let mut states = HashMap::new();
        states.insert("up".to_owned(), SeriesState::Used);
        cache.set_states(&states, Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let got = cache.get_states(&["up".to_owned()]).await;
        assert!(got.is_empty());
    }
}
