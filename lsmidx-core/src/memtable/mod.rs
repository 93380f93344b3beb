//! MemTable: the mutable "top" structure absorbing recent inserts
//!
//! A concurrent skip list keyed by (key, row) so that non-unique indexes can
//! hold the same key for several rows while exact duplicates stay idempotent.
//! Durability is provided by the per-structure write-ahead log, not here.

use crate::{IndexEntry, IndexKey, RowRef};
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Key for MemTable entries (index key + row address)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemTableKey {
    /// Index key
    pub key: IndexKey,
    /// Row address
    pub row: RowRef,
}

impl MemTableKey {
    /// Create a new MemTable key
    pub fn new(key: IndexKey, row: RowRef) -> Self {
        Self { key, row }
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.key.len() + 6
    }
}

/// In-memory top structure
pub struct MemTable {
    /// Concurrent ordered map of (key, row) -> covering payload
    data: SkipMap<MemTableKey, Vec<u8>>,
    /// Approximate size in bytes
    size_bytes: AtomicUsize,
    /// Structure id recorded in the dictionary
    id: u64,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new(id: u64) -> Self {
        Self {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            id,
        }
    }

    /// Get the structure id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert an entry; returns false if this exact (key, row) pair
    /// was already present
    pub fn insert(&self, entry: &IndexEntry) -> bool {
        let key = MemTableKey::new(entry.key.clone(), entry.row);
        if self.data.contains_key(&key) {
            return false;
        }

        let entry_size = key.size() + entry.value.len();
        self.data.insert(key, entry.value.clone());
        self.size_bytes.fetch_add(entry_size, Ordering::Relaxed);
        true
    }

    /// Check whether any entry with this key is present
    pub fn contains_key(&self, key: &IndexKey) -> bool {
        let lo = MemTableKey::new(key.clone(), RowRef::MIN);
        let hi = MemTableKey::new(key.clone(), RowRef::MAX);
        self.data
            .range((Bound::Included(lo), Bound::Included(hi)))
            .next()
            .is_some()
    }

    /// Get all (row, payload) pairs stored under a key
    pub fn get(&self, key: &IndexKey) -> Vec<(RowRef, Vec<u8>)> {
        let lo = MemTableKey::new(key.clone(), RowRef::MIN);
        let hi = MemTableKey::new(key.clone(), RowRef::MAX);
        self.data
            .range((Bound::Included(lo), Bound::Included(hi)))
            .map(|e| (e.key().row, e.value().clone()))
            .collect()
    }

    /// Snapshot of all entries in sorted order
    pub fn iter(&self) -> Vec<IndexEntry> {
        self.data
            .iter()
            .map(|e| IndexEntry {
                key: e.key().key.clone(),
                value: e.value().clone(),
                row: e.key().row,
            })
            .collect()
    }

    /// Check if the top structure has outgrown the configured limit
    pub fn should_merge(&self, size_limit: usize) -> bool {
        self.size_bytes.load(Ordering::Relaxed) >= size_limit
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sorted_iteration() {
        let memtable = MemTable::new(1);

        for i in [5u64, 1, 4, 2, 3] {
            let entry = IndexEntry::new(i, "", RowRef::new(0, i as u16));
            assert!(memtable.insert(&entry));
        }

        let entries = memtable.iter();
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.key, IndexKey::from(i as u64 + 1));
        }
    }

    #[test]
    fn test_duplicate_row_is_idempotent() {
        let memtable = MemTable::new(1);
        let entry = IndexEntry::new("k", "v", RowRef::new(3, 7));

        assert!(memtable.insert(&entry));
        assert!(!memtable.insert(&entry));
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn test_non_unique_key_holds_many_rows() {
        let memtable = MemTable::new(1);
        memtable.insert(&IndexEntry::new("k", "a", RowRef::new(0, 1)));
        memtable.insert(&IndexEntry::new("k", "b", RowRef::new(0, 2)));

        let key = IndexKey::from("k");
        assert!(memtable.contains_key(&key));
        let rows = memtable.get(&key);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, RowRef::new(0, 1));
    }

    #[test]
    fn test_size_tracking() {
        let memtable = MemTable::new(1);
        assert_eq!(memtable.size(), 0);
        assert!(!memtable.should_merge(1));

        memtable.insert(&IndexEntry::new("key", "value", RowRef::new(0, 0)));
        assert!(memtable.size() > 0);
        assert!(memtable.should_merge(1));
    }

    #[test]
    fn test_concurrent_inserts() {
        use std::sync::Arc;

        let memtable = Arc::new(MemTable::new(1));
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let memtable = memtable.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..250u16 {
                    let entry =
                        IndexEntry::new(u64::from(t) * 1000 + u64::from(i), "", RowRef::new(t, i));
                    memtable.insert(&entry);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(memtable.len(), 1000);
        let entries = memtable.iter();
        assert!(entries.windows(2).all(|w| w[0].key <= w[1].key));
    }
}
