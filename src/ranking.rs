use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};

use crate::keys::ImageKey;

/// A key waiting for a free display slot, with its accumulated popularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedEntry {
    pub key: ImageKey,
    pub count: u32,
    pub first_seen: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapSlot {
    count: u32,
    first_seen: u64,
    fingerprint: String,
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher count wins, then the older entry (smaller
        // first_seen) within equal popularity.
        self.count
            .cmp(&other.count)
            .then_with(|| other.first_seen.cmp(&self.first_seen))
    }
}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Indexed priority buffer over image keys.
///
/// Each `bump` pushes a fresh heap slot, leaving stale ones for keys whose
/// count has since grown; `peek`/`take` discard any slot that no longer
/// matches the live map, and the heap is rebuilt from the map once stale
/// slots outnumber live entries. Heap size stays proportional to the number
/// of distinct keys, and all operations stay O(log n) amortized.
#[derive(Debug, Default)]
pub struct RankingBuffer {
    entries: HashMap<String, RankedEntry>,
    heap: BinaryHeap<HeapSlot>,
    tick: u64,
}

impl RankingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `key`.
    pub fn bump(&mut self, key: &ImageKey) {
        let fingerprint = key.fingerprint();
        let (count, first_seen) = match self.entries.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.count += 1;
                (entry.count, entry.first_seen)
            }
            Entry::Vacant(vacant) => {
                let first_seen = self.tick;
                self.tick += 1;
                vacant.insert(RankedEntry {
                    key: key.clone(),
                    count: 1,
                    first_seen,
                });
                (1, first_seen)
            }
        };
        self.heap.push(HeapSlot {
            count,
            first_seen,
            fingerprint,
        });
        self.compact_if_bloated();
    }

    /// Put back an entry that was taken but could not be sent. The original
    /// `first_seen` keeps its place within equal popularity, so a briefly
    /// failed pop does not lose priority.
    pub fn reinsert(&mut self, entry: RankedEntry) {
        let fingerprint = entry.key.fingerprint();
        let merged = self
            .entries
            .entry(fingerprint.clone())
            .and_modify(|e| {
                e.count += entry.count;
                e.first_seen = e.first_seen.min(entry.first_seen);
            })
            .or_insert_with(|| entry.clone());
        let slot = HeapSlot {
            count: merged.count,
            first_seen: merged.first_seen,
            fingerprint,
        };
        self.heap.push(slot);
        self.compact_if_bloated();
    }

    /// Highest-priority key without removing it.
    pub fn peek(&mut self) -> Option<&RankedEntry> {
        self.discard_stale();
        let top = self.heap.peek()?;
        self.entries.get(&top.fingerprint)
    }

    /// Remove and return the highest-priority entry.
    pub fn take(&mut self) -> Option<RankedEntry> {
        self.discard_stale();
        let top = self.heap.pop()?;
        self.entries.remove(&top.fingerprint)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            match self.entries.get(&top.fingerprint) {
                Some(live)
                    if live.count == top.count && live.first_seen == top.first_seen =>
                {
                    return;
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Rebuild the heap from the live map once superseded slots outnumber
    /// entries. The O(n) rebuild amortizes against the pushes that grew the
    /// heap, so a key bumped in a tight loop cannot grow it without bound.
    fn compact_if_bloated(&mut self) {
        if self.heap.len() <= self.entries.len().saturating_mul(2).max(8) {
            return;
        }
        self.heap = self
            .entries
            .iter()
            .map(|(fingerprint, entry)| HeapSlot {
                count: entry.count,
                first_seen: entry.first_seen,
                fingerprint: fingerprint.clone(),
            })
            .collect();
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }
}
