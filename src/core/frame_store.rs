//! Bounded frame store with LRU eviction
//!
//! Structure: IndexMap<usize, CacheEntry>
//! - Key: frame index
//! - Iteration order: recency (front = least recently used)
//!
//! Every access stamps the entry with a monotonic `last_access_seq`, so the
//! recency order is total and eviction is deterministic. Eviction skips
//! protected indices (playhead, frames awaiting delivery).
//!
//! The store has a single owner (the player) and is written only by the fetch
//! coordinator and by its own eviction, so it needs no locking.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::entities::Frame;

/// Cache statistics for monitoring. Never affect behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheStats {
    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Point-in-time view of the store for UI/logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident_count: usize,
    pub capacity: usize,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

/// Cached frame plus its recency stamp
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub frame: Frame,
    pub last_access_seq: u64,
}

/// Resident working set of frames
#[derive(Debug)]
pub struct FrameStore {
    entries: IndexMap<usize, CacheEntry>,
    capacity: usize,
    seq: u64,
    stats: CacheStats,
}

impl FrameStore {
    /// Create store holding at most `capacity` frames (min 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("FrameStore created: capacity={}", capacity);

        Self {
            entries: IndexMap::with_capacity(capacity + 1),
            capacity,
            seq: 0,
            stats: CacheStats::default(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Move entry to the back of the recency queue with a fresh stamp
    fn bump(&mut self, index: usize) -> bool {
        let seq = self.next_seq();
        let Some((_, mut entry)) = self.entries.shift_remove_entry(&index) else {
            return false;
        };
        entry.last_access_seq = seq;
        self.entries.insert(index, entry);
        true
    }

    /// Get frame and refresh its recency. Counts a hit or a miss.
    pub fn get(&mut self, index: usize) -> Option<Frame> {
        if self.bump(index) {
            self.stats.record_hit();
            self.entries.get(&index).map(|e| e.frame.clone())
        } else {
            self.stats.record_miss();
            None
        }
    }

    /// Get frame without touching recency or stats
    pub fn peek(&self, index: usize) -> Option<&Frame> {
        self.entries.get(&index).map(|e| &e.frame)
    }

    pub fn has(&self, index: usize) -> bool {
        self.entries.contains_key(&index)
    }

    /// Refresh recency without a fetch. Returns false if not resident.
    pub fn touch(&mut self, index: usize) -> bool {
        self.bump(index)
    }

    /// Insert or replace a frame as most recently used.
    ///
    /// Does not evict; call `evict_if_over_capacity` afterwards.
    pub fn put(&mut self, index: usize, frame: Frame) {
        let seq = self.next_seq();
        let size = frame.mem();
        if self.entries.shift_remove(&index).is_some() {
            trace!("Replaced frame {}", index);
        }
        self.entries.insert(
            index,
            CacheEntry {
                frame,
                last_access_seq: seq,
            },
        );
        trace!("Cached frame {} ({} bytes, seq {})", index, size, seq);
    }

    /// Evict least recently used frames until within capacity.
    ///
    /// Protected indices are never evicted, so the store can stay over
    /// capacity when everything left is protected. Returns evicted indices.
    pub fn evict_if_over_capacity(&mut self, protected: &BTreeSet<usize>) -> Vec<usize> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.lru_victim(protected) {
                Some(index) => {
                    self.entries.shift_remove(&index);
                    self.stats.record_eviction();
                    evicted.push(index);
                }
                None => break,
            }
        }
        if !evicted.is_empty() {
            debug!("LRU evicted {} frame(s): {:?}", evicted.len(), evicted);
        }
        evicted
    }

    /// Unprotected entry with lowest (last_access_seq, index)
    fn lru_victim(&self, protected: &BTreeSet<usize>) -> Option<usize> {
        self.entries
            .iter()
            .filter(|(idx, _)| !protected.contains(idx))
            .min_by_key(|(idx, e)| (e.last_access_seq, **idx))
            .map(|(idx, _)| *idx)
    }

    /// Drop a single frame
    pub fn remove(&mut self, index: usize) -> Option<Frame> {
        self.entries.shift_remove(&index).map(|e| e.frame)
    }

    /// Drop everything (dataset switch)
    pub fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.stats.reset();
        debug!("Cleared frame store ({} frames)", count);
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        debug!("FrameStore capacity set to {}", self.capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resident indices, ascending
    pub fn resident_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.entries.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Recency stamp of a resident frame
    pub fn last_access_seq(&self, index: usize) -> Option<u64> {
        self.entries.get(&index).map(|e| e.last_access_seq)
    }

    /// Total payload bytes held
    pub fn mem(&self) -> usize {
        self.entries.values().map(|e| e.frame.mem()).sum()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            resident_count: self.entries.len(),
            capacity: self.capacity,
        }
    }
}
