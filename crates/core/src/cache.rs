//! C5 — Embedding Cache: bounded LRU keyed by the embedded text's hash
//! (spec.md §4.5). Returned vectors are copies; callers cannot observe
//! mutation of the cached slice. Invariant: `len(cache) <= max_size`,
//! eviction is strict LRU on access.

use crate::hash::hash_content;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub struct EmbeddingCache {
    inner: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new(max_size: usize) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).unwrap();
        Self { inner: Mutex::new(LruCache::new(cap)) }
    }

    /// `Get(text) -> (vec, hit)`.
    pub fn get(&self, text: &str) -> (Option<Vec<f32>>, bool) {
        let key = hash_content(text);
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match guard.get(&key) {
            Some(v) => (Some(v.clone()), true),
            None => (None, false),
        }
    }

    /// `Set(text, vec)`.
    pub fn set(&self, text: &str, vector: Vec<f32>) {
        let key = hash_content(text);
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.put(key, vector);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_set_returns_a_copy() {
        let cache = EmbeddingCache::new(4);
        cache.set("fn f() {}", vec![1.0, 2.0, 3.0]);

        let (vec, hit) = cache.get("fn f() {}");
        assert!(hit);
        let mut vec = vec.unwrap();
        vec[0] = 99.0;

        let (vec2, _) = cache.get("fn f() {}");
        assert_eq!(vec2.unwrap()[0], 1.0);
    }

    #[test]
    fn miss_on_unseen_text() {
        let cache = EmbeddingCache::new(4);
        let (vec, hit) = cache.get("never set");
        assert!(!hit);
        assert!(vec.is_none());
    }

    #[test]
    fn evicts_least_recently_used_beyond_capacity() {
        let cache = EmbeddingCache::new(2);
        cache.set("a", vec![1.0]);
        cache.set("b", vec![2.0]);
        cache.get("a"); // touch a, making b the LRU
        cache.set("c", vec![3.0]); // evicts b

        assert!(cache.get("a").1);
        assert!(!cache.get("b").1);
        assert!(cache.get("c").1);
        assert_eq!(cache.len(), 2);
    }
}
