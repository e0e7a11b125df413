//! Result cache for idempotent read methods.
//!
//! Backed by [`moka`] with per-method TTL. Entries are keyed by a
//! fingerprint of the method name plus the configured `key_fields` of the
//! params (the whole params document when no fields are configured), so two
//! calls that only differ in irrelevant fields share a slot.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use tracing::debug;

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }
}

/// Shared response cache across all cached methods.
#[derive(Clone)]
pub struct ResultCache {
    inner: Cache<String, Value>,
    stats: Arc<CacheStats>,
}

impl ResultCache {
    pub fn new(max_capacity: u64, default_ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(default_ttl)
                .build(),
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Fingerprint for a `(method, params)` pair over the selected fields.
    pub fn fingerprint(method: &str, params: &Value, key_fields: &[String]) -> String {
        let keyed: Value = if key_fields.is_empty() {
            params.clone()
        } else {
            let mut object = serde_json::Map::new();
            for field in key_fields {
                if let Some(v) = params.get(field) {
                    object.insert(field.clone(), v.clone());
                }
            }
            Value::Object(object)
        };

        // serde_json object serialization is key-ordered for Maps built
        // field-by-field here; hash the canonical text.
        let text = keyed.to_string();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        method.hash(&mut hasher);
        text.hash(&mut hasher);
        format!("{method}:{:016x}", hasher.finish())
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        match self.inner.get(key).await {
            Some(value) => {
                self.stats.record_hit();
                debug!(key = key, "result cache hit");
                Some(value)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    pub async fn insert(&self, key: String, value: Value) {
        self.inner.insert(key, value).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
