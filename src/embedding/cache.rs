use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{Embedder, EmbeddingError};

/// Source of recency stamps for eviction. Stamps should not decrease.
pub trait CacheClock: Send + Sync {
    fn now(&self) -> u64;
}

/// Counter clock advancing once per read.
#[derive(Debug, Default)]
pub struct LogicalClock(AtomicU64);

impl CacheClock for LogicalClock {
    fn now(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

struct Entry {
    vector: Arc<Vec<f32>>,
    key: (u64, u64),
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Entry>,
    // (stamp, sequence) -> text; first key is the least recently used
    recency: BTreeMap<(u64, u64), String>,
    sequence: u64,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn next_key(&mut self, clock: &dyn CacheClock) -> (u64, u64) {
        self.sequence += 1;
        (clock.now(), self.sequence)
    }

    fn touch(&mut self, text: &str, clock: &dyn CacheClock) -> Option<Arc<Vec<f32>>> {
        let key = self.next_key(clock);
        let entry = self.entries.get_mut(text)?;
        let old = std::mem::replace(&mut entry.key, key);
        let vector = Arc::clone(&entry.vector);
        self.recency.remove(&old);
        self.recency.insert(key, text.to_string());
        Some(vector)
    }

    fn insert(&mut self, text: String, vector: Arc<Vec<f32>>, capacity: usize, clock: &dyn CacheClock) {
        if capacity == 0 {
            return;
        }
        let key = self.next_key(clock);
        if let Some(previous) = self.entries.insert(text.clone(), Entry { vector, key }) {
            self.recency.remove(&previous.key);
        }
        self.recency.insert(key, text);

        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Bounded least-recently-used memo in front of an [`Embedder`]. Keys are the
/// exact input strings; misses in one call are computed in a single batch.
pub struct EmbeddingCache {
    embedder: Arc<dyn Embedder>,
    capacity: usize,
    clock: Arc<dyn CacheClock>,
    inner: Mutex<CacheInner>,
}

impl EmbeddingCache {
    pub fn new(embedder: Arc<dyn Embedder>, capacity: usize) -> Self {
        Self::with_clock(embedder, capacity, Arc::new(LogicalClock::default()))
    }

    pub fn with_clock(embedder: Arc<dyn Embedder>, capacity: usize, clock: Arc<dyn CacheClock>) -> Self {
        Self {
            embedder,
            capacity,
            clock,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut resolved: HashMap<&str, Arc<Vec<f32>>> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        {
            let mut inner = self.lock();
            let mut queued = HashSet::new();
            for text in texts {
                if resolved.contains_key(text.as_str()) || queued.contains(text.as_str()) {
                    continue;
                }
                match inner.touch(text, self.clock.as_ref()) {
                    Some(vector) => {
                        inner.hits += 1;
                        resolved.insert(text.as_str(), vector);
                    }
                    None => {
                        queued.insert(text.as_str());
                        missing.push(text.clone());
                    }
                }
            }
            inner.misses += missing.len() as u64;
        }

        if !missing.is_empty() {
            let vectors = self.embedder.embed(&missing).await?;
            if vectors.len() != missing.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} vectors, got {}",
                    missing.len(),
                    vectors.len()
                )));
            }

            let mut inner = self.lock();
            for (text, vector) in missing.iter().zip(vectors) {
                let vector = Arc::new(vector);
                inner.insert(text.clone(), Arc::clone(&vector), self.capacity, self.clock.as_ref());
                if let Some(original) = texts.iter().find(|t| *t == text) {
                    resolved.insert(original.as_str(), vector);
                }
            }
        }

        texts
            .iter()
            .map(|text| {
                resolved
                    .get(text.as_str())
                    .map(|v| v.as_ref().clone())
                    .ok_or_else(|| EmbeddingError::InvalidResponse(format!("no vector for {:?}", text)))
            })
            .collect()
    }

    pub async fn encode_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.encode(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding batch".to_string()))
    }

    pub fn contains(&self, text: &str) -> bool {
        self.lock().entries.contains_key(text)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.lock().hits
    }

    pub fn misses(&self) -> u64 {
        self.lock().misses
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEmbedder;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn repeated_texts_hit_the_cache() {
        let embedder = Arc::new(FakeEmbedder::default());
        let cache = EmbeddingCache::new(embedder.clone(), 8);

        let first = cache.encode(&strings(&["derivada", "integral"])).await.unwrap();
        let second = cache.encode(&strings(&["integral", "derivada"])).await.unwrap();

        assert_eq!(embedder.calls(), 1);
        assert_eq!(first[0], second[1]);
        assert_eq!(first[1], second[0]);
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 2);
    }

    #[tokio::test]
    async fn duplicate_misses_are_embedded_once() {
        let embedder = Arc::new(FakeEmbedder::default());
        let cache = EmbeddingCache::new(embedder.clone(), 8);

        let vectors = cache.encode(&strings(&["a", "a", "b"])).await.unwrap();

        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[1]);
        assert_eq!(embedder.embedded_texts(), 2);
    }

    #[tokio::test]
    async fn cached_and_fresh_vectors_are_identical() {
        let embedder = Arc::new(FakeEmbedder::default());
        let cache = EmbeddingCache::new(embedder.clone(), 8);

        let cached = cache.encode_one("fotosíntesis").await.unwrap();
        let again = cache.encode_one("fotosíntesis").await.unwrap();
        let fresh = embedder.embed(&strings(&["fotosíntesis"])).await.unwrap();

        assert_eq!(cached, again);
        assert_eq!(cached, fresh[0]);
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let embedder = Arc::new(FakeEmbedder::default());
        let cache = EmbeddingCache::new(embedder.clone(), 2);

        cache.encode(&strings(&["a", "b"])).await.unwrap();
        cache.encode_one("a").await.unwrap();
        cache.encode_one("c").await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    struct FrozenClock;

    impl CacheClock for FrozenClock {
        fn now(&self) -> u64 {
            42
        }
    }

    #[tokio::test]
    async fn equal_stamps_fall_back_to_insertion_order() {
        let embedder = Arc::new(FakeEmbedder::default());
        let cache = EmbeddingCache::with_clock(embedder, 2, Arc::new(FrozenClock));

        cache.encode(&strings(&["a", "b", "c"])).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert_eq!(cache.capacity(), 2);
    }
}
