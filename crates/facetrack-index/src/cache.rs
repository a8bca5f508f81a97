//! TTL and size bounded cache of recent match results.
//!
//! Keys are SHA-256 digests of the raw embedding bytes, so repeated queries
//! with the same vector skip the backend entirely. The cache is invalidated
//! wholesale on removal; additions leave it alone, stale hits for brand-new
//! faces age out within one TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::types::MatchResult;

pub type CacheKey = [u8; 32];

/// Digest an embedding's little-endian byte representation into a cache key.
pub fn cache_key(embedding_bytes: &[u8]) -> CacheKey {
    let digest = Sha256::digest(embedding_bytes);
    digest.into()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    results: Vec<MatchResult>,
    inserted_at: Instant,
}

/// Hit/miss counters, reset only when the cache is recreated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct QueryCache {
    entries: HashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    hits: u64,
    misses: u64,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up cached results, treating expired entries as misses.
    pub fn get(&mut self, key: &CacheKey) -> Option<Vec<MatchResult>> {
        match self.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.hits += 1;
                Some(entry.results.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store results for a key, evicting the oldest entries when full.
    pub fn insert(&mut self, key: CacheKey, results: Vec<MatchResult>) {
        while self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| *k);
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                results,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries. Called periodically so unqueried keys do not
    /// pin memory for the life of the process.
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn result(person: &str) -> MatchResult {
        MatchResult {
            person_id: person.into(),
            confidence: 0.9,
            encoding_id: format!("{person}-face"),
            quality_score: 1.0,
            metadata: Default::default(),
            match_time: Duration::from_millis(1),
            match_distance: Some(0.8),
        }
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let mut cache = QueryCache::new(Duration::from_secs(60), 8);
        let key = cache_key(b"abc");
        assert!(cache.get(&key).is_none());
        cache.insert(key, vec![result("alice")]);
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit[0].person_id, "alice");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let mut cache = QueryCache::new(Duration::from_millis(10), 8);
        let key = cache_key(b"abc");
        cache.insert(key, vec![result("alice")]);
        sleep(Duration::from_millis(20));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_size_bound_evicts_oldest() {
        let mut cache = QueryCache::new(Duration::from_secs(60), 2);
        let k1 = cache_key(b"one");
        let k2 = cache_key(b"two");
        let k3 = cache_key(b"three");
        cache.insert(k1, vec![result("a")]);
        sleep(Duration::from_millis(2));
        cache.insert(k2, vec![result("b")]);
        sleep(Duration::from_millis(2));
        cache.insert(k3, vec![result("c")]);

        assert_eq!(cache.stats().entries, 2);
        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let mut cache = QueryCache::new(Duration::from_millis(30), 8);
        cache.insert(cache_key(b"old"), vec![result("a")]);
        sleep(Duration::from_millis(40));
        cache.insert(cache_key(b"new"), vec![result("b")]);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_invalidate_all() {
        let mut cache = QueryCache::new(Duration::from_secs(60), 8);
        cache.insert(cache_key(b"one"), vec![result("a")]);
        cache.insert(cache_key(b"two"), vec![result("b")]);
        cache.invalidate_all();
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_same_bytes_same_key() {
        assert_eq!(cache_key(b"payload"), cache_key(b"payload"));
        assert_ne!(cache_key(b"payload"), cache_key(b"payloae"));
    }
}
