//! Bounded TTL+LRU cache shared by the enrichment backends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    access: HashMap<String, Instant>,
}

/// String-keyed cache with per-entry expiry and least-recently-accessed
/// eviction at capacity. Expired entries are served as absent and removed
/// lazily on touch.
#[derive(Debug)]
pub struct Cache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<V: Clone> Cache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                access: HashMap::new(),
            }),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    /// A hit refreshes the entry's access time.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.entries.get(key) {
            None => None,
            Some(entry) if entry.expires_at <= now => {
                inner.entries.remove(key);
                inner.access.remove(key);
                None
            }
            Some(entry) => {
                let value = entry.value.clone();
                inner.access.insert(key.to_owned(), now);
                Some(value)
            }
        }
    }

    pub fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if !inner.entries.contains_key(key) && inner.entries.len() >= self.capacity {
            evict_lru(&mut inner);
        }
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        inner.access.insert(key.to_owned(), now);
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(key);
        inner.access.remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.access.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk-remove every expired entry.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            inner.entries.remove(&key);
            inner.access.remove(&key);
        }
    }
}

fn evict_lru<V>(inner: &mut Inner<V>) {
    let victim = inner
        .access
        .iter()
        .min_by_key(|(_, accessed)| **accessed)
        .map(|(key, _)| key.clone());
    if let Some(key) = victim {
        trace!(%key, "evicting least recently used cache entry");
        inner.entries.remove(&key);
        inner.access.remove(&key);
    }
}
