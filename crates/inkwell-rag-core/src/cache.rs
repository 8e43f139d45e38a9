//! Time-bounded memoization of ranked retrieval results.
//!
//! Entries are keyed by the normalized query text and a [`ScopeFingerprint`],
//! a digest over the `(source_path, last_indexed_mtime)` pairs of every file
//! in scope. Any reindex of an in-scope file changes the fingerprint, so a
//! stale entry can no longer be addressed. Entries also expire after a TTL
//! and are dropped explicitly by [`QueryCache::invalidate`].
//!
//! The cache is a plain struct; the engine wraps it in a mutex.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::rank::RankedChunk;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_ENTRIES: usize = 64;

/// Lowercase and collapse runs of whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identity of a retrieval scope at a point in its index history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeFingerprint {
    digest: String,
    mtimes: BTreeMap<String, i64>,
}

impl ScopeFingerprint {
    /// Build from `(source_path, last_indexed_mtime)` pairs in any order.
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mtimes: BTreeMap<String, i64> = files.into_iter().map(|(p, m)| (p.into(), m)).collect();
        let mut hasher = Sha256::new();
        for (path, mtime) in &mtimes {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(mtime.to_le_bytes());
        }
        Self {
            digest: format!("{:x}", hasher.finalize()),
            mtimes,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn contains(&self, source_path: &str) -> bool {
        self.mtimes.contains_key(source_path)
    }

    pub fn mtime_of(&self, source_path: &str) -> Option<i64> {
        self.mtimes.get(source_path).copied()
    }

    pub fn len(&self) -> usize {
        self.mtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mtimes.is_empty()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    ranked: Vec<RankedChunk>,
    mtimes: BTreeMap<String, i64>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, scope: &ScopeFingerprint, now: Instant) -> bool {
        now < self.expires_at
            && self
                .mtimes
                .iter()
                .all(|(path, recorded)| scope.mtime_of(path).is_some_and(|m| m <= *recorded))
    }
}

/// Counters reported by [`QueryCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Hits as a percentage of lookups, 0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

type CacheKey = (String, String);

/// Bounded TTL cache of ranked results.
#[derive(Debug)]
pub struct QueryCache {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<CacheKey, CacheEntry>,
    order: VecDeque<CacheKey>,
    stats: CacheStats,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl QueryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, query: &str, scope: &ScopeFingerprint) -> Option<Vec<RankedChunk>> {
        self.get_at(query, scope, Instant::now())
    }

    /// Look up `query` as of `now`. Expired or stale entries are evicted.
    pub fn get_at(
        &mut self,
        query: &str,
        scope: &ScopeFingerprint,
        now: Instant,
    ) -> Option<Vec<RankedChunk>> {
        let key = (normalize_query(query), scope.digest.clone());

        let fresh = match self.entries.get(&key) {
            None => {
                self.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.is_fresh(scope, now),
        };

        if !fresh {
            self.remove_key(&key);
            self.stats.invalidations += 1;
            self.stats.misses += 1;
            return None;
        }

        self.stats.hits += 1;
        self.entries.get(&key).map(|e| e.ranked.clone())
    }

    pub fn put(&mut self, query: &str, scope: &ScopeFingerprint, ranked: Vec<RankedChunk>) {
        self.put_at(query, scope, ranked, self.ttl, Instant::now());
    }

    pub fn put_with_ttl(
        &mut self,
        query: &str,
        scope: &ScopeFingerprint,
        ranked: Vec<RankedChunk>,
        ttl: Duration,
    ) {
        self.put_at(query, scope, ranked, ttl, Instant::now());
    }

    /// Store `ranked` as of `now`, evicting the oldest entry when full.
    pub fn put_at(
        &mut self,
        query: &str,
        scope: &ScopeFingerprint,
        ranked: Vec<RankedChunk>,
        ttl: Duration,
        now: Instant,
    ) {
        let key = (normalize_query(query), scope.digest.clone());
        if self.entries.contains_key(&key) {
            self.remove_key(&key);
        }
        while self.entries.len() >= self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        self.entries.insert(
            key.clone(),
            CacheEntry {
                ranked,
                mtimes: scope.mtimes.clone(),
                expires_at: now + ttl,
            },
        );
        self.order.push_back(key);
        self.stats.entries = self.entries.len();
    }

    /// Drop every entry whose scope included `source_path`.
    pub fn invalidate(&mut self, source_path: &str) -> usize {
        let doomed: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.mtimes.contains_key(source_path))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.remove_key(key);
        }
        if !doomed.is_empty() {
            tracing::debug!(
                source = source_path,
                count = doomed.len(),
                "invalidated cached queries"
            );
        }
        self.stats.invalidations += doomed.len() as u64;
        doomed.len()
    }

    pub fn invalidate_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.order.clear();
        self.stats.invalidations += count as u64;
        self.stats.entries = 0;
        count
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }

    fn remove_key(&mut self, key: &CacheKey) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
        self.stats.entries = self.entries.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(ids: &[&str]) -> Vec<RankedChunk> {
        ids.iter()
            .map(|id| RankedChunk {
                chunk_id: id.to_string(),
                score: 1.0,
                keyword_score: 1.0,
                semantic_score: 0.0,
            })
            .collect()
    }

    fn scope(files: &[(&str, i64)]) -> ScopeFingerprint {
        ScopeFingerprint::new(files.iter().map(|(p, m)| (*p, *m)))
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  Chime's   KEY\tconflict "), "chime's key conflict");
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let a = scope(&[("a.md", 1), ("b.md", 2)]);
        let b = scope(&[("b.md", 2), ("a.md", 1)]);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), scope(&[("a.md", 1), ("b.md", 3)]).digest());
    }

    #[test]
    fn test_hit_after_put_with_normalized_query() {
        let mut cache = QueryCache::default();
        let fp = scope(&[("a.md", 1)]);
        cache.put("Who is Chime?", &fp, ranked(&["a#0"]));
        let hit = cache.get("  who is   chime? ", &fp).unwrap();
        assert_eq!(hit[0].chunk_id, "a#0");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_mtime_advance_is_a_miss() {
        let mut cache = QueryCache::default();
        cache.put("q", &scope(&[("a.md", 1)]), ranked(&["a#0"]));
        assert!(cache.get("q", &scope(&[("a.md", 2)])).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_ttl_expiry_evicts_lazily() {
        let mut cache = QueryCache::new(Duration::from_secs(10), 8);
        let fp = scope(&[("a.md", 1)]);
        let start = Instant::now();
        cache.put_at("q", &fp, ranked(&["a#0"]), Duration::from_secs(10), start);
        assert!(cache.get_at("q", &fp, start + Duration::from_secs(9)).is_some());
        assert!(cache.get_at("q", &fp, start + Duration::from_secs(10)).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_invalidate_only_affected_scopes() {
        let mut cache = QueryCache::default();
        cache.put("q1", &scope(&[("a.md", 1), ("b.md", 1)]), ranked(&["a#0"]));
        cache.put("q2", &scope(&[("c.md", 1)]), ranked(&["c#0"]));
        assert_eq!(cache.invalidate("b.md"), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("q2", &scope(&[("c.md", 1)])).is_some());
        assert_eq!(cache.invalidate("missing.md"), 0);
    }

    #[test]
    fn test_oldest_entry_evicted_when_full() {
        let mut cache = QueryCache::new(DEFAULT_TTL, 2);
        let fp = scope(&[("a.md", 1)]);
        cache.put("one", &fp, ranked(&["1"]));
        cache.put("two", &fp, ranked(&["2"]));
        cache.put("three", &fp, ranked(&["3"]));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("one", &fp).is_none());
        assert!(cache.get("three", &fp).is_some());
    }

    #[test]
    fn test_invalidate_all_and_hit_rate() {
        let mut cache = QueryCache::default();
        let fp = scope(&[("a.md", 1)]);
        cache.put("q", &fp, ranked(&["a#0"]));
        cache.get("q", &fp);
        cache.get("other", &fp);
        assert_eq!(cache.stats().hit_rate(), 50.0);
        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.is_empty());
    }
}
