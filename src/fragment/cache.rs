use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Default number of rows tracked per fragment cache.
pub const DEFAULT_CACHE_SIZE: usize = 50_000;

/// A (row, count) result pair. Ordered by count descending, then row
/// ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub id: u64,
    pub count: u64,
}

/// Sort pairs into rank order: larger count first, lower row id on ties.
pub fn sort_pairs(pairs: &mut [Pair]) {
    pairs.sort_unstable_by(|a, b| b.count.cmp(&a.count).then(a.id.cmp(&b.id)));
}

/// Cache policy for a field's fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Ranked,
    Lru,
    None,
}

impl Default for CacheType {
    fn default() -> Self {
        CacheType::Ranked
    }
}

impl CacheType {
    pub fn parse(s: &str) -> DbResult<CacheType> {
        match s {
            "ranked" => Ok(CacheType::Ranked),
            "lru" => Ok(CacheType::Lru),
            "none" => Ok(CacheType::None),
            other => Err(DbError::InvalidCacheType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Ranked => "ranked",
            CacheType::Lru => "lru",
            CacheType::None => "none",
        }
    }
}

/// Per-fragment cache of row cardinalities powering top-N.
///
/// The ranked variant keeps a bounded rank ordering that is re-sorted
/// lazily; the LRU variant keeps recently touched rows and evicts by
/// recency. Updated under the owning fragment's write lock.
#[derive(Debug)]
pub enum RowCache {
    Ranked(RankedCache),
    Lru(LruRowCache),
    None,
}

impl RowCache {
    pub fn new(cache_type: CacheType, size: usize) -> RowCache {
        let size = size.max(1);
        match cache_type {
            CacheType::Ranked => RowCache::Ranked(RankedCache::new(size)),
            CacheType::Lru => RowCache::Lru(LruRowCache::new(size)),
            CacheType::None => RowCache::None,
        }
    }

    /// Record a row's new cardinality. A count of zero removes the entry.
    pub fn update(&mut self, row: u64, count: u64) {
        match self {
            RowCache::Ranked(c) => c.update(row, count),
            RowCache::Lru(c) => c.update(row, count),
            RowCache::None => {}
        }
    }

    /// Tracked rows, the candidate set for top-N.
    pub fn ids(&mut self) -> Vec<u64> {
        match self {
            RowCache::Ranked(c) => c.rankings().iter().map(|p| p.id).collect(),
            RowCache::Lru(c) => c.inner.iter().map(|(row, _)| *row).collect(),
            RowCache::None => Vec::new(),
        }
    }

    /// The first `k` pairs in rank order (all pairs when `k` is zero).
    pub fn top(&mut self, k: usize) -> Vec<Pair> {
        let mut pairs = match self {
            RowCache::Ranked(c) => c.rankings().to_vec(),
            RowCache::Lru(c) => {
                let mut pairs: Vec<Pair> = c
                    .inner
                    .iter()
                    .map(|(row, count)| Pair {
                        id: *row,
                        count: *count,
                    })
                    .collect();
                sort_pairs(&mut pairs);
                pairs
            }
            RowCache::None => Vec::new(),
        };
        if k > 0 {
            pairs.truncate(k);
        }
        pairs
    }

    pub fn len(&self) -> usize {
        match self {
            RowCache::Ranked(c) => c.entries.len(),
            RowCache::Lru(c) => c.inner.len(),
            RowCache::None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rank-ordered cache. Counts live in a map; the sorted view is rebuilt
/// lazily so a burst of mutations pays for one sort, not one per update.
#[derive(Debug)]
pub struct RankedCache {
    entries: HashMap<u64, u64>,
    rankings: Vec<Pair>,
    stale: bool,
    size: usize,
}

impl RankedCache {
    fn new(size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            rankings: Vec::new(),
            stale: false,
            size,
        }
    }

    fn update(&mut self, row: u64, count: u64) {
        if count == 0 {
            self.entries.remove(&row);
        } else {
            self.entries.insert(row, count);
        }
        self.stale = true;
        // Keep memory bounded during heavy ingest between reads.
        if self.entries.len() > self.size * 2 {
            self.resort();
        }
    }

    fn rankings(&mut self) -> &[Pair] {
        if self.stale {
            self.resort();
        }
        &self.rankings
    }

    fn resort(&mut self) {
        let mut pairs: Vec<Pair> = self
            .entries
            .iter()
            .map(|(row, count)| Pair {
                id: *row,
                count: *count,
            })
            .collect();
        sort_pairs(&mut pairs);
        pairs.truncate(self.size);
        // Entries that fell off the ranking stop being tracked.
        if pairs.len() < self.entries.len() {
            self.entries = pairs.iter().map(|p| (p.id, p.count)).collect();
        }
        self.rankings = pairs;
        self.stale = false;
    }
}

/// Recency-evicting cache over (row, count).
#[derive(Debug)]
pub struct LruRowCache {
    inner: LruCache<u64, u64>,
}

impl LruRowCache {
    fn new(size: usize) -> Self {
        Self {
            inner: LruCache::new(NonZeroUsize::new(size).unwrap_or(NonZeroUsize::new(1).unwrap())),
        }
    }

    fn update(&mut self, row: u64, count: u64) {
        if count == 0 {
            self.inner.pop(&row);
        } else {
            self.inner.put(row, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_type_parse() {
        assert_eq!(CacheType::parse("ranked").unwrap(), CacheType::Ranked);
        assert_eq!(CacheType::parse("lru").unwrap(), CacheType::Lru);
        assert_eq!(CacheType::parse("none").unwrap(), CacheType::None);
        assert!(CacheType::parse("fifo").is_err());
    }

    #[test]
    fn test_ranked_ordering() {
        let mut cache = RowCache::new(CacheType::Ranked, 100);
        cache.update(1, 5);
        cache.update(2, 9);
        cache.update(3, 7);

        let top = cache.top(2);
        assert_eq!(
            top,
            vec![Pair { id: 2, count: 9 }, Pair { id: 3, count: 7 }]
        );
    }

    #[test]
    fn test_ranked_tie_break_low_row_first() {
        let mut cache = RowCache::new(CacheType::Ranked, 100);
        cache.update(9, 4);
        cache.update(2, 4);
        cache.update(5, 4);

        let top = cache.top(0);
        assert_eq!(top.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2, 5, 9]);
    }

    #[test]
    fn test_ranked_eviction_keeps_largest() {
        let mut cache = RowCache::new(CacheType::Ranked, 3);
        for row in 0..10u64 {
            cache.update(row, row + 1);
        }
        let top = cache.top(0);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0], Pair { id: 9, count: 10 });
    }

    #[test]
    fn test_zero_count_removes_entry() {
        let mut cache = RowCache::new(CacheType::Ranked, 100);
        cache.update(7, 3);
        cache.update(7, 0);
        assert!(cache.top(0).is_empty());
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let mut cache = RowCache::new(CacheType::Lru, 2);
        cache.update(1, 10);
        cache.update(2, 20);
        cache.update(3, 30);

        let ids = cache.ids();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&1));
    }

    #[test]
    fn test_none_tracks_nothing() {
        let mut cache = RowCache::new(CacheType::None, 100);
        cache.update(1, 5);
        assert!(cache.top(0).is_empty());
        assert!(cache.ids().is_empty());
    }
}
