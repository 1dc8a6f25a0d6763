//! LRU + TTL cache for code-execution results.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

struct CachedEntry {
    value: Value,
    logs: Vec<String>,
    inserted_at: Instant,
}

pub struct ResultCache {
    entries: Mutex<LruCache<String, CachedEntry>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero"),
            )),
            ttl,
        }
    }

    /// Cache key: code, canonical context and the tool-schema version hash,
    /// so schema changes invalidate cached results.
    pub fn key(code: &str, context: &Value, schema_versions: &str) -> String {
        tmg_wire::content_hash(&[code, &context.to_string(), schema_versions])
    }

    pub fn get(&self, key: &str) -> Option<(Value, Vec<String>)> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                Some((entry.value.clone(), entry.logs.clone()))
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, value: Value, logs: Vec<String>) {
        self.entries.lock().put(
            key,
            CachedEntry {
                value,
                logs,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
