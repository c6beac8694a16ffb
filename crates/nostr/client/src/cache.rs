//! Shared lookup cache for resolved profiles and events.

use crate::config::CacheConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

struct CacheInner<V> {
    entries: HashMap<String, V>,
    /// Keys in access order, oldest first
    lru_queue: VecDeque<String>,
}

/// Write-once map from lookup key to resolved value, with LRU eviction.
///
/// The first value stored for a key wins; later writes for the same key are
/// ignored until the entry is evicted.
pub struct LookupCache<V> {
    config: CacheConfig,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> Default for LookupCache<V> {
    fn default() -> Self {
        Self::with_config(CacheConfig::default())
    }
}

impl<V: Clone> LookupCache<V> {
    /// Create a new cache with default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new cache with custom config
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                lru_queue: VecDeque::new(),
            }),
        }
    }

    /// Store a value. Returns false if the key was already cached (or caching
    /// is disabled) and the value was discarded.
    pub fn insert(&self, key: impl Into<String>, value: V) -> bool {
        if !self.config.enabled {
            return false;
        }
        let key = key.into();
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            return false;
        }

        if self.config.max_entries > 0
            && inner.entries.len() >= self.config.max_entries
            && let Some(oldest) = inner.lru_queue.pop_front()
        {
            inner.entries.remove(&oldest);
        }

        inner.entries.insert(key.clone(), value);
        inner.lru_queue.push_back(key);
        true
    }

    /// Get a cached value, marking it recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.config.enabled {
            return None;
        }
        let mut inner = self.inner.lock();
        let value = inner.entries.get(key).cloned()?;
        if inner.lru_queue.back().map(String::as_str) != Some(key) {
            inner.lru_queue.retain(|k| k != key);
            inner.lru_queue.push_back(key.to_string());
        }
        Some(value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.config.enabled && self.inner.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru_queue.clear();
    }
}
