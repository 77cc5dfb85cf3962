use lru::LruCache;
use serde::Serialize;

use crate::value::CacheValue;

/// Default byte budget of the in-process tier (200 MiB).
pub const DEFAULT_MEMORY_SIZE: usize = 200 * 1024 * 1024;

struct Entry {
    value: CacheValue,
    size: usize,
}

/// Counters kept by [`MemoryCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LocalStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

/// In-process LRU bounded by the estimated byte size of its values.
pub struct MemoryCache {
    entries: LruCache<String, Entry>,
    max_bytes: usize,
    bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl MemoryCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_bytes,
            bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<CacheValue> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or replace `key`, evicting least recently used entries until
    /// the budget holds again. A value larger than the whole budget is not
    /// stored (and any older value under `key` is dropped).
    pub fn set(&mut self, key: String, value: CacheValue) {
        let size = value.size();
        if size > self.max_bytes {
            self.delete(&key);
            return;
        }
        if let Some(old) = self.entries.put(key, Entry { value, size }) {
            self.bytes -= old.size;
        }
        self.bytes += size;
        while self.bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.bytes -= evicted.size;
                    self.evictions += 1;
                }
                None => break,
            }
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.bytes -= entry.size;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn stats(&self) -> LocalStats {
        LocalStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.entries.len(),
            bytes: self.bytes,
        }
    }
}
