use crate::error::Result;
use crate::store::{load, save, KeyValueStore};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const CACHE_PREFIX: &str = "cache_";

/// Persisted form: `{data, timestamp, expires}` with millisecond epoch timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    #[serde(rename = "timestamp")]
    pub stored_at_ms: i64,
    #[serde(rename = "expires")]
    pub expires_at_ms: i64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.expires_at_ms
    }

    pub fn stored_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.stored_at_ms).single()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub data: Value,
    pub stored_at: Option<DateTime<Utc>>,
    /// The entry outlived its TTL and was served only because stale reads were allowed.
    pub stale: bool,
}

/// TTL cache for safe-method responses on top of a [`KeyValueStore`].
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration, enabled: bool) -> Self {
        Self {
            store,
            ttl,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `cache_<path>_<serialized query>`; an absent query serializes as `{}`.
    pub fn key(path: &str, query: Option<&Value>) -> String {
        let serialized = match query {
            Some(value) if !value.is_null() => value.to_string(),
            _ => "{}".to_string(),
        };
        format!("{CACHE_PREFIX}{path}_{serialized}")
    }

    pub fn put(&self, key: &str, data: &Value) -> Result<()> {
        self.put_at(key, data, Utc::now())
    }

    pub fn put_at(&self, key: &str, data: &Value, now: DateTime<Utc>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let stored_at_ms = now.timestamp_millis();
        let entry = CacheEntry {
            data: data.clone(),
            stored_at_ms,
            expires_at_ms: stored_at_ms.saturating_add(ttl_ms),
        };
        save(self.store.as_ref(), key, &entry)
    }

    pub fn get(&self, key: &str, allow_stale: bool) -> Result<Option<CachedResponse>> {
        self.get_at(key, Utc::now(), allow_stale)
    }

    /// Expired entries are evicted on read unless `allow_stale` is set, in which
    /// case they are returned flagged as stale and left in place.
    pub fn get_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
        allow_stale: bool,
    ) -> Result<Option<CachedResponse>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(entry) = load::<CacheEntry>(self.store.as_ref(), key)? else {
            return Ok(None);
        };
        let expired = entry.is_expired_at(now);
        if expired && !allow_stale {
            self.store.remove(key)?;
            return Ok(None);
        }
        Ok(Some(CachedResponse {
            stored_at: entry.stored_at(),
            data: entry.data,
            stale: expired,
        }))
    }

    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.store.remove(key)
    }

    pub fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now())
    }

    /// Removes every expired cache entry. Unreadable entries are removed as well.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for key in self.store.keys()? {
            if !key.starts_with(CACHE_PREFIX) {
                continue;
            }
            let expired = match load::<CacheEntry>(self.store.as_ref(), &key) {
                Ok(Some(entry)) => entry.is_expired_at(now),
                Ok(None) => false,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "dropping unreadable cache entry");
                    true
                }
            };
            if expired {
                self.store.remove(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache entries");
        }
        Ok(removed)
    }
}
