//! Hot-document cache
//!
//! Bounded in-memory cache in front of the data file. Hits skip the bloom
//! filter, the index and the disk read entirely. Eviction is LRU; a hit
//! promotes the entry, applied consistently for every lookup path.

use crate::Document;
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;

/// Cache statistics
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Current cache size
    pub size: usize,
    /// Maximum cache size
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded document cache keyed by document id
pub struct DocumentCache {
    cache: RwLock<LruCache<String, Document>>,
    stats: RwLock<CacheStats>,
}

impl DocumentCache {
    /// Create a cache holding at most `capacity` documents.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            cache: RwLock::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
            stats: RwLock::new(CacheStats {
                capacity,
                ..Default::default()
            }),
        }
    }

    /// Look up a document, promoting it on hit.
    pub fn get(&self, id: &str) -> Option<Document> {
        let mut cache = self.cache.write();
        match cache.get(id) {
            Some(doc) => {
                self.stats.write().hits += 1;
                Some(doc.clone())
            }
            None => {
                self.stats.write().misses += 1;
                None
            }
        }
    }

    /// Insert a document, evicting the least recently used entry when full.
    pub fn insert(&self, id: String, document: Document) {
        let mut cache = self.cache.write();
        cache.put(id, document);
        self.stats.write().size = cache.len();
    }

    /// Drop a document from the cache (on delete or invalidation).
    pub fn remove(&self, id: &str) {
        let mut cache = self.cache.write();
        cache.pop(id);
        self.stats.write().size = cache.len();
    }

    /// Number of cached documents
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of hit/miss statistics
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: i64) -> Document {
        let mut d = Document::new();
        d.insert("v".to_string(), json!(v));
        d
    }

    #[test]
    fn test_cache_basic() {
        let cache = DocumentCache::new(100);

        assert!(cache.get("a").is_none());

        cache.insert("a".to_string(), doc(1));
        assert_eq!(cache.get("a").unwrap(), doc(1));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_cache_remove() {
        let cache = DocumentCache::new(100);
        cache.insert("a".to_string(), doc(1));
        cache.remove("a");
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_cache_eviction_at_capacity() {
        let cache = DocumentCache::new(3);

        for i in 1..=3 {
            cache.insert(format!("d{}", i), doc(i));
        }
        assert_eq!(cache.len(), 3);

        // One more insert evicts the least recently used entry.
        cache.insert("d4".to_string(), doc(4));
        assert_eq!(cache.len(), 3);
        assert!(cache.get("d1").is_none());
        assert!(cache.get("d4").is_some());
    }

    #[test]
    fn test_cache_promotion_on_hit() {
        let cache = DocumentCache::new(2);

        cache.insert("a".to_string(), doc(1));
        cache.insert("b".to_string(), doc(2));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.insert("c".to_string(), doc(3));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }
}
