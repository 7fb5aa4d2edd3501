use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

/// Thread-safe LRU cache of query embeddings.
///
/// Follow-up questions in a conversation are often re-sent verbatim (retries,
/// the comparison view asking twice), so the standalone question is cached by
/// its normalised text together with the embedding model that produced it.
pub struct EmbeddingCache {
    cache: Mutex<LruCache<(String, String), Vec<f32>>>,
}

fn normalize(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl EmbeddingCache {
    /// Capacity is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<(String, String), Vec<f32>>> {
        // A panic while holding the lock cannot leave the LRU half-updated in a way we care about.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, model: &str, query: &str) -> Option<Vec<f32>> {
        self.lock()
            .get(&(model.to_string(), normalize(query)))
            .cloned()
    }

    pub fn put(&self, model: &str, query: &str, embedding: Vec<f32>) {
        self.lock().put((model.to_string(), normalize(query)), embedding);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_put_and_get() {
        let cache = EmbeddingCache::new(10);
        cache.put("m", "what is  meditation?", vec![1.0, 2.0]);

        assert_eq!(cache.get("m", "what is meditation?"), Some(vec![1.0, 2.0]));
        assert!(cache.get("other-model", "what is meditation?").is_none());
    }

    #[test]
    fn test_cache_eviction_respects_recent_use() {
        let cache = EmbeddingCache::new(2);
        cache.put("m", "q1", vec![1.0]);
        cache.put("m", "q2", vec![2.0]);

        let _ = cache.get("m", "q1");
        cache.put("m", "q3", vec![3.0]);

        assert!(cache.get("m", "q1").is_some());
        assert!(cache.get("m", "q2").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let cache = EmbeddingCache::new(0);
        assert!(cache.is_empty());
        cache.put("m", "q", vec![0.5]);
        assert_eq!(cache.len(), 1);
    }
}
