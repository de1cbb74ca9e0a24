//! # PageCache — byte-budget cache keyed by page position
//!
//! Maps a 64-bit page position to a cached value (the store caches
//! `Arc<Page>`), charging each entry its in-memory footprint against a fixed
//! byte budget.
//!
//! Eviction is a segmented LRU: new entries start in the *probation*
//! segment; a hit there promotes to the *protected* segment (capped at a
//! fraction of the budget, overflow demotes back to probation as
//! most-recently-used). Eviction scans the probation tail first, so pages
//! touched once and never again leave quickly while repeatedly-read pages
//! stay resident. This approximates the original design's LIRS behaviour;
//! correctness never depends on the policy, only throughput does.
//!
//! The cache is a plain data structure: callers provide their own locking.

use std::collections::{BTreeMap, HashMap};

/// Fraction of the budget reserved for the protected segment, in percent.
const PROTECTED_PERCENT: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Probation,
    Protected,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    cost: usize,
    stamp: u64,
    segment: Segment,
}

/// A fixed byte-budget cache with segmented LRU eviction.
#[derive(Debug)]
pub struct PageCache<V> {
    capacity: usize,
    entries: HashMap<u64, Entry<V>>,
    /// Recency order per segment: access stamp → key. Stamps are unique.
    probation: BTreeMap<u64, u64>,
    protected: BTreeMap<u64, u64>,
    used: usize,
    protected_used: usize,
    next_stamp: u64,
}

impl<V> PageCache<V> {
    /// Creates a cache with the given byte budget.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            probation: BTreeMap::new(),
            protected: BTreeMap::new(),
            used: 0,
            protected_used: 0,
            next_stamp: 0,
        }
    }

    /// The configured byte budget.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently charged against the budget.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up `key`, refreshing its recency and promoting probation hits
    /// into the protected segment.
    pub fn get(&mut self, key: u64) -> Option<&V> {
        let (old_stamp, segment, cost) = {
            let entry = self.entries.get(&key)?;
            (entry.stamp, entry.segment, entry.cost)
        };
        let stamp = self.bump_stamp();
        match segment {
            Segment::Probation => {
                self.probation.remove(&old_stamp);
                self.protected.insert(stamp, key);
                self.protected_used += cost;
                let entry = self.entries.get_mut(&key).expect("entry vanished");
                entry.segment = Segment::Protected;
                entry.stamp = stamp;
                self.shrink_protected();
            }
            Segment::Protected => {
                self.protected.remove(&old_stamp);
                self.protected.insert(stamp, key);
                self.entries.get_mut(&key).expect("entry vanished").stamp = stamp;
            }
        }
        self.entries.get(&key).map(|e| &e.value)
    }

    /// Inserts `value` under `key` with the given byte cost, evicting from
    /// the probation tail (then the protected tail) until it fits.
    ///
    /// Entries costing more than the whole budget are not cached.
    pub fn insert(&mut self, key: u64, value: V, cost: usize) {
        if cost > self.capacity {
            self.remove(key);
            return;
        }
        self.remove(key);
        while self.used + cost > self.capacity {
            if !self.evict_one() {
                break;
            }
        }
        let stamp = self.bump_stamp();
        self.used += cost;
        self.probation.insert(stamp, key);
        self.entries.insert(
            key,
            Entry {
                value,
                cost,
                stamp,
                segment: Segment::Probation,
            },
        );
    }

    /// Removes `key`, returning its value if present.
    pub fn remove(&mut self, key: u64) -> Option<V> {
        let entry = self.entries.remove(&key)?;
        self.used -= entry.cost;
        match entry.segment {
            Segment::Probation => {
                self.probation.remove(&entry.stamp);
            }
            Segment::Protected => {
                self.protected.remove(&entry.stamp);
                self.protected_used -= entry.cost;
            }
        }
        Some(entry.value)
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.probation.clear();
        self.protected.clear();
        self.used = 0;
        self.protected_used = 0;
    }

    fn bump_stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    /// Evicts the coldest entry, preferring the probation segment.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .probation
            .iter()
            .next()
            .or_else(|| self.protected.iter().next())
            .map(|(_, &key)| key);
        match victim {
            Some(key) => {
                self.remove(key);
                true
            }
            None => false,
        }
    }

    /// Demotes protected-tail entries until the segment fits its share of
    /// the budget.
    fn shrink_protected(&mut self) {
        let budget = self.capacity * PROTECTED_PERCENT / 100;
        while self.protected_used > budget {
            let Some((&stamp, &key)) = self.protected.iter().next() else {
                break;
            };
            self.protected.remove(&stamp);
            let fresh = self.bump_stamp();
            let entry = self
                .entries
                .get_mut(&key)
                .expect("protected order out of sync with entries");
            entry.segment = Segment::Probation;
            entry.stamp = fresh;
            let cost = entry.cost;
            self.protected_used -= cost;
            self.probation.insert(fresh, key);
        }
    }
}
