//! In-process TTL cache for query results.
//!
//! Entries are evicted lazily: an expired entry is dropped by the lookup
//! that finds it (or by [`QueryCache::purge_expired`]).

use crate::{catalog::DataSource, mapper::Row};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to encode cache key: {0}")]
    Key(#[from] serde_json::Error),
    #[error("ttl out of range: {0:?}")]
    Ttl(Duration),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
    pub rows: Vec<Row>,
    pub query_id: String,
    pub data_source: DataSource,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntrySummary {
    pub key: String,
    pub query_id: String,
    pub data_source: DataSource,
    pub row_count: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// Derives the cache key: hex SHA-256 over the canonical JSON of the data
/// source, query id and parameters (object keys sorted at every level).
pub fn cache_key(
    source: DataSource,
    query_id: &str,
    parameters: &Map<String, Value>,
) -> Result<String, CacheError> {
    let mut envelope = Map::new();
    envelope.insert("dataSource".into(), Value::String(source.as_str().into()));
    envelope.insert("parameters".into(), Value::Object(parameters.clone()));
    envelope.insert("queryId".into(), Value::String(query_id.into()));

    let canonical = serde_json::to_vec(&canonicalize(Value::Object(envelope)))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

pub struct QueryCache {
    entries: RwLock<HashMap<String, CachedResult>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &str) -> Option<CachedResult> {
        let now = Utc::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Re-check under the write lock; another writer may have refreshed it.
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
            entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key, "evicted expired cache entry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(
        &self,
        key: String,
        query_id: &str,
        data_source: DataSource,
        rows: Vec<Row>,
        ttl: Option<Duration>,
    ) -> Result<CachedResult, CacheError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .ok_or(CacheError::Ttl(ttl))?;

        let entry = CachedResult {
            rows,
            query_id: query_id.to_string(),
            data_source,
            created_at,
            expires_at,
        };
        self.entries.write().insert(key, entry.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Drops every entry produced by `query_id`; returns how many were removed.
    pub fn invalidate_query(&self, query_id: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.query_id != query_id);
        before - entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn entries(&self, query_id: Option<&str>) -> Vec<CacheEntrySummary> {
        let now = Utc::now();
        let mut summaries: Vec<CacheEntrySummary> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .filter(|(_, entry)| query_id.map_or(true, |id| entry.query_id == id))
            .map(|(key, entry)| CacheEntrySummary {
                key: key.clone(),
                query_id: entry.query_id.clone(),
                data_source: entry.data_source,
                row_count: entry.rows.len(),
                created_at: entry.created_at,
                expires_at: entry.expires_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.entries.read().len(),
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn row(name: &str) -> Row {
        params(json!({ "username": name }))
    }

    #[test]
    fn key_ignores_parameter_order_but_not_values() {
        let a = cache_key(
            DataSource::Ad,
            "inactive_users",
            &params(json!({ "days": 90, "scope": { "b": 1, "a": 2 } })),
        )
        .unwrap();
        let b = cache_key(
            DataSource::Ad,
            "inactive_users",
            &params(json!({ "scope": { "a": 2, "b": 1 }, "days": 90 })),
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other_days =
            cache_key(DataSource::Ad, "inactive_users", &params(json!({ "days": 30 }))).unwrap();
        let other_source =
            cache_key(DataSource::Azure, "inactive_users", &params(json!({ "days": 90 }))).unwrap();
        assert_ne!(other_days, other_source);
        assert_ne!(a, other_days);
    }

    #[test]
    fn hit_then_expire() {
        let cache = QueryCache::new(Duration::from_secs(60));
        cache
            .set("k1".into(), "q", DataSource::Postgres, vec![row("a")], None)
            .unwrap();
        let hit = cache.get("k1").unwrap();
        assert_eq!(hit.rows, vec![row("a")]);

        cache
            .set("k2".into(), "q", DataSource::Postgres, vec![], Some(Duration::ZERO))
            .unwrap();
        assert!(cache.get("k2").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn invalidates_by_query() {
        let cache = QueryCache::new(Duration::from_secs(60));
        for (key, query) in [("a", "q1"), ("b", "q1"), ("c", "q2")] {
            cache
                .set(key.into(), query, DataSource::Ad, vec![row(key)], None)
                .unwrap();
        }
        assert_eq!(cache.entries(Some("q1")).len(), 2);
        assert_eq!(cache.invalidate_query("q1"), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
        assert!(cache.invalidate("c"));
        assert_eq!(cache.clear(), 0);
    }
}
